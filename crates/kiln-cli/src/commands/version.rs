//! `kiln version` command implementation.

use kiln_core::VERSION;

pub fn run(json: bool) {
    if json {
        println!("{}", serde_json::json!({ "name": "kiln", "version": VERSION }));
    } else {
        println!("kiln {VERSION}");
    }
}
