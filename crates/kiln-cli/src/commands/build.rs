//! `kiln build` command implementation.

use kiln_core::{BuildConfig, BuildSnapshot, Bundler, Mode};
use miette::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub cwd: PathBuf,
    pub mode: Mode,
    /// Output directory override.
    pub dist: Option<PathBuf>,
    /// Explicit config file.
    pub config: Option<PathBuf>,
}

/// Build result for JSON output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildResultJson {
    ok: bool,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dir: Option<String>,
    artifacts: Vec<ArtifactJson>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BuildErrorJson>,
}

#[derive(Serialize)]
struct ArtifactJson {
    file: String,
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk: Option<String>,
}

#[derive(Serialize)]
struct BuildErrorJson {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

/// Run the build command.
pub fn run(action: BuildAction, json: bool) -> Result<()> {
    let started = Instant::now();
    let outcome = build(&action);
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok((output_dir, snapshot)) => {
            let artifacts: Vec<ArtifactJson> = snapshot
                .artifacts()
                .map(|a| ArtifactJson {
                    file: a.filename.clone(),
                    size: a.size(),
                    chunk: a.chunk.clone(),
                })
                .collect();
            if json {
                print_json(&BuildResultJson {
                    ok: true,
                    mode: action.mode.as_str(),
                    output_dir: Some(output_dir.display().to_string()),
                    artifacts,
                    duration_ms,
                    error: None,
                });
            } else {
                print_human_output(&output_dir, action.mode, &artifacts, duration_ms);
            }
            Ok(())
        }
        Err(e) => {
            if json {
                print_json(&BuildResultJson {
                    ok: false,
                    mode: action.mode.as_str(),
                    output_dir: None,
                    artifacts: Vec::new(),
                    duration_ms,
                    error: Some(BuildErrorJson {
                        code: e.code(),
                        message: e.to_string(),
                        file: e.path().map(|p| p.display().to_string()),
                    }),
                });
                std::process::exit(1);
            }
            Err(miette::miette!(code = e.code(), "{}", e))
        }
    }
}

fn build(action: &BuildAction) -> kiln_core::Result<(PathBuf, Arc<BuildSnapshot>)> {
    let mut config = BuildConfig::load(&action.cwd, action.config.as_deref())?.with_mode(action.mode);
    if let Some(dist) = &action.dist {
        config = config.with_output_dir(dist);
    }
    let bundler = Bundler::new(config)?;
    let build = bundler.build()?;
    let output_dir = bundler.write(&build)?;
    Ok((output_dir, build.snapshot))
}

fn print_json(result: &BuildResultJson) {
    match serde_json::to_string(result) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error: failed to serialize result: {e}"),
    }
}

fn print_human_output(output_dir: &std::path::Path, mode: Mode, artifacts: &[ArtifactJson], duration_ms: u64) {
    let width = artifacts.iter().map(|a| a.file.len()).max().unwrap_or(4).max(4);
    println!();
    println!("  {:<width$}  {:>10}  chunk", "file", "size");
    for artifact in artifacts {
        println!(
            "  {:<width$}  {:>10}  {}",
            artifact.file,
            format_size(artifact.size),
            artifact.chunk.as_deref().unwrap_or("-"),
        );
    }
    println!();
    let total: usize = artifacts.iter().map(|a| a.size).sum();
    println!(
        "  {} build: {} files, {} in {}ms -> {}",
        mode.as_str(),
        artifacts.len(),
        format_size(total),
        duration_ms,
        output_dir.display()
    );
}

fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_error_json_shape() {
        let result = BuildResultJson {
            ok: false,
            mode: "production",
            output_dir: None,
            artifacts: Vec::new(),
            duration_ms: 3,
            error: Some(BuildErrorJson {
                code: "UNRESOLVED_IMPORT",
                message: "Cannot resolve './x'".into(),
                file: Some("/p/src/a.js".into()),
            }),
        };
        let json: serde_json::Value = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["durationMs"], 3);
        assert_eq!(json["error"]["code"], "UNRESOLVED_IMPORT");
        assert!(json.get("outputDir").is_none());
    }
}
