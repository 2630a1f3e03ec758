//! Integration tests for `kiln dev`.
//!
//! Starts the dev server as a child process, then checks that it serves the
//! build from memory and picks up source edits without writing `dist/`.

use serial_test::serial;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

struct DevServer {
    child: Child,
    port: u16,
}

impl DevServer {
    fn start(cwd: &Path) -> Self {
        let port = free_port();
        let child = Command::new(env!("CARGO"))
            .args(["run", "-p", "kiln-cli", "--bin", "kiln", "--", "dev", "--port"])
            .arg(port.to_string())
            .arg("--cwd")
            .arg(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start dev server");
        let server = Self { child, port };
        // First run may have to compile the binary
        server
            .wait_for(Duration::from_secs(180), |status| status.contains("\"state\""))
            .expect("dev server did not come up");
        server
    }

    fn get(&self, path: &str) -> Option<String> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).ok()?;
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .ok()?;
        let mut response = String::new();
        stream.read_to_string(&mut response).ok()?;
        Some(response)
    }

    fn status(&self) -> Option<serde_json::Value> {
        let response = self.get("/__kiln/status")?;
        let body = response.split("\r\n\r\n").nth(1)?;
        serde_json::from_str(body).ok()
    }

    fn wait_for(&self, timeout: Duration, check: impl Fn(&str) -> bool) -> Option<String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(response) = self.get("/__kiln/status") {
                if check(&response) {
                    return Some(response);
                }
            }
            thread::sleep(Duration::from_millis(200));
        }
        None
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

fn project(root: &Path) {
    write(
        root,
        "kiln.json",
        r#"{"entries": [{"name": "main", "import": "./src/main.js"}]}"#,
    );
    write(root, "src/main.js", "require('./main.css');\n");
    write(root, "src/main.css", "h1 { color: red; }\n");
}

#[test]
#[serial]
#[cfg_attr(windows, ignore = "Flaky on Windows CI due to file watcher timing")]
fn test_dev_serves_from_memory() {
    let dir = tempdir().unwrap();
    project(dir.path());
    let server = DevServer::start(dir.path());

    let index = server.get("/").unwrap();
    assert!(index.starts_with("HTTP/1.1 200"), "{index}");
    assert!(index.contains("/__kiln/client.js"));

    let client = server.get("/__kiln/client.js").unwrap();
    assert!(client.contains("/__kiln/ws"));

    let status = server.status().unwrap();
    assert_eq!(status["state"], "serving");
    assert!(status["lastError"].is_null());

    assert!(!dir.path().join("dist").exists());
}

#[test]
#[serial]
#[cfg_attr(windows, ignore = "Flaky on Windows CI due to file watcher timing")]
fn test_dev_rebuilds_on_change() {
    let dir = tempdir().unwrap();
    project(dir.path());
    let server = DevServer::start(dir.path());

    let before = server.status().unwrap()["hash"].as_str().unwrap().to_string();

    // Give the watcher a moment to settle before editing
    thread::sleep(Duration::from_millis(500));
    write(dir.path(), "src/main.css", "h1 { color: blue; }\n");

    let changed = server.wait_for(Duration::from_secs(30), |response| {
        !response.contains(&before)
    });
    assert!(changed.is_some(), "hash did not change after edit");

    // A broken edit keeps serving and reports the error
    write(dir.path(), "src/main.js", "require('./gone');\n");
    let failed = server.wait_for(Duration::from_secs(30), |response| {
        response.contains("UNRESOLVED_IMPORT")
    });
    assert!(failed.is_some(), "rebuild error was not reported");
    assert_eq!(server.status().unwrap()["state"], "serving");
}
