use std::path::PathBuf;
use std::sync::Arc;

use revive_core::default_app_root;
use revive_core::logging::init_tracing;
use revive_core::pipeline::health::check_engine;
use revive_core::pipeline::orchestrator::JobOrchestrator;
use revive_core::pipeline::request::{
    ColorizeParams, EngineParams, ProcessingRequest, RestoreParams,
};
use revive_core::pipeline::settings_layer::load_engine_settings;
use revive_core::pipeline::workspace::{batch_requests, ensure_workspace_dirs};
use revive_core::pipeline::EngineKind;
use revive_core::worker::{spawn_batch, spawn_job, BatchCoordinator, BatchEvent, CancelFlag};
use tracing::{debug, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (global, command) = parse_cli_args(cli_args.as_slice())?;
    if command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    let app_root = global.app_root.unwrap_or_else(default_app_root);
    let log_path = init_tracing(app_root.as_path());
    debug!(app_root = %app_root.display(), log_file = ?log_path, "revive starting");

    let settings = Arc::new(load_engine_settings(
        app_root.as_path(),
        global.settings_path.as_deref(),
    )?);
    ensure_workspace_dirs(&settings)?;
    let orchestrator = Arc::new(JobOrchestrator::new(settings.clone()));
    let default_output = || settings.default_output_dir();

    match command {
        CliCommand::Restore {
            input,
            output,
            params,
        } => {
            let request =
                ProcessingRequest::restore(input, output.unwrap_or_else(default_output), params)?;
            let output = spawn_job(orchestrator, request).await??;
            println!("{}", output.output_path.display());
        }
        CliCommand::Colorize {
            input,
            output,
            params,
        } => {
            let request =
                ProcessingRequest::colorize(input, output.unwrap_or_else(default_output), params)?;
            let output = spawn_job(orchestrator, request).await??;
            println!("{}", output.output_path.display());
        }
        CliCommand::Batch {
            folder,
            engine,
            output,
            json,
        } => {
            let output_dir = output.unwrap_or_else(default_output);
            let requests = batch_requests(
                folder.as_path(),
                output_dir.as_path(),
                &EngineParams::default_for(engine),
            )?;
            if requests.is_empty() {
                return Err(std::io::Error::other(format!(
                    "No supported images found in {}",
                    folder.display()
                ))
                .into());
            }
            run_batch_cli(orchestrator, requests, json).await?;
        }
        CliCommand::CheckEngine { engine } => {
            let report = tokio::task::spawn_blocking(move || {
                check_engine(orchestrator.as_ref(), engine)
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                return Err(std::io::Error::other(format!(
                    "{} health check failed",
                    engine.tool_name()
                ))
                .into());
            }
        }
        CliCommand::Help => {}
    }
    Ok(())
}

async fn run_batch_cli(
    orchestrator: Arc<JobOrchestrator>,
    requests: Vec<ProcessingRequest>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelFlag::new();
    let (mut events, handle) = spawn_batch(
        BatchCoordinator::new(orchestrator),
        requests,
        cancel.clone(),
    );

    let mut report = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BatchEvent::Progress(progress)) => {
                    if !json {
                        println!(
                            "[{}/{}] {}",
                            progress.index + 1,
                            progress.total,
                            progress.filename
                        );
                    }
                }
                Some(BatchEvent::Finished(finished)) => report = Some(finished),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                warn!("cancellation requested; stopping after the current image");
                cancel.cancel();
            }
        }
    }
    handle.await?;

    let report = report.ok_or_else(|| std::io::Error::other("batch ended without a report"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary_message());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Default)]
struct GlobalArgs {
    app_root: Option<PathBuf>,
    settings_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Restore {
        input: PathBuf,
        output: Option<PathBuf>,
        params: RestoreParams,
    },
    Colorize {
        input: PathBuf,
        output: Option<PathBuf>,
        params: ColorizeParams,
    },
    Batch {
        folder: PathBuf,
        engine: EngineKind,
        output: Option<PathBuf>,
        json: bool,
    },
    CheckEngine {
        engine: EngineKind,
    },
    Help,
}

fn parse_cli_args(
    args: &[String],
) -> Result<(GlobalArgs, CliCommand), Box<dyn std::error::Error>> {
    let mut global = GlobalArgs::default();
    let mut rest = Vec::new();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                global.app_root = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--settings" => {
                global.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "-h" | "--help" => return Ok((global, CliCommand::Help)),
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }

    let Some((command, command_args)) = rest.split_first() else {
        return Ok((global, CliCommand::Help));
    };
    let command = match command.as_str() {
        "restore" => parse_restore_args(command_args)?,
        "colorize" => parse_colorize_args(command_args)?,
        "batch" => parse_batch_args(command_args)?,
        "check-engine" => {
            let [engine] = command_args else {
                return Err(std::io::Error::other(
                    "check-engine expects exactly one engine: restore or colorize",
                )
                .into());
            };
            CliCommand::CheckEngine {
                engine: parse_engine(engine)?,
            }
        }
        "help" => CliCommand::Help,
        unknown => {
            return Err(std::io::Error::other(format!(
                "Unknown command: {unknown}\n\nUse --help for usage."
            ))
            .into());
        }
    };
    Ok((global, command))
}

fn parse_restore_args(args: &[String]) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut input = None::<PathBuf>;
    let mut output = None::<PathBuf>;
    let mut params = RestoreParams::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--output" | "-o" => {
                output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--model" => {
                params.model_name = needs_value(i)?;
                i += 2;
            }
            "--scale" => {
                params.outscale = needs_value(i)?
                    .parse::<f64>()
                    .map_err(|_| std::io::Error::other("--scale expects a number"))?;
                i += 2;
            }
            "--no-face-enhance" => {
                params.face_enhance = false;
                i += 1;
            }
            positional if !positional.starts_with('-') && input.is_none() => {
                input = Some(PathBuf::from(positional));
                i += 1;
            }
            unknown => return Err(unknown_argument(unknown)),
        }
    }

    Ok(CliCommand::Restore {
        input: input.ok_or_else(|| std::io::Error::other("Missing input image"))?,
        output,
        params,
    })
}

fn parse_colorize_args(args: &[String]) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut input = None::<PathBuf>;
    let mut output = None::<PathBuf>;
    let mut params = ColorizeParams::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--output" | "-o" => {
                output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--stable" => {
                params.artistic = false;
                i += 1;
            }
            "--render-factor" => {
                params.render_factor = needs_value(i)?
                    .parse::<u32>()
                    .map_err(|_| std::io::Error::other("--render-factor expects an integer"))?;
                i += 2;
            }
            positional if !positional.starts_with('-') && input.is_none() => {
                input = Some(PathBuf::from(positional));
                i += 1;
            }
            unknown => return Err(unknown_argument(unknown)),
        }
    }

    Ok(CliCommand::Colorize {
        input: input.ok_or_else(|| std::io::Error::other("Missing input image"))?,
        output,
        params,
    })
}

fn parse_batch_args(args: &[String]) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut folder = None::<PathBuf>;
    let mut engine = None::<EngineKind>;
    let mut output = None::<PathBuf>;
    let mut json = false;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--engine" => {
                engine = Some(parse_engine(needs_value(i)?.as_str())?);
                i += 2;
            }
            "--output" | "-o" => {
                output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--json" => {
                json = true;
                i += 1;
            }
            positional if !positional.starts_with('-') && folder.is_none() => {
                folder = Some(PathBuf::from(positional));
                i += 1;
            }
            unknown => return Err(unknown_argument(unknown)),
        }
    }

    Ok(CliCommand::Batch {
        folder: folder.ok_or_else(|| std::io::Error::other("Missing input folder"))?,
        engine: engine.ok_or_else(|| std::io::Error::other("Missing required --engine"))?,
        output,
        json,
    })
}

fn parse_engine(value: &str) -> Result<EngineKind, Box<dyn std::error::Error>> {
    EngineKind::parse(value).ok_or_else(|| {
        std::io::Error::other(format!(
            "Unknown engine: {value} (expected restore or colorize)"
        ))
        .into()
    })
}

fn unknown_argument(arg: &str) -> Box<dyn std::error::Error> {
    std::io::Error::other(format!("Unknown argument: {arg}\n\nUse --help for usage.")).into()
}

fn print_usage() {
    println!(
        "Usage:\n  revive [--app-root DIR] [--settings PATH] <command>\n\n\
Commands:\n  \
restore <input> [--output DIR] [--model M] [--scale F] [--no-face-enhance]\n  \
colorize <input> [--output DIR] [--stable] [--render-factor N]\n  \
batch <folder> --engine restore|colorize [--output DIR] [--json]\n  \
check-engine <restore|colorize>"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_restore_with_globals_anywhere() {
        let (global, command) = parse_cli_args(&args(&[
            "restore",
            "old.jpg",
            "--app-root",
            "/opt/revive",
            "--scale",
            "4",
            "--no-face-enhance",
        ]))
        .expect("parse");
        assert_eq!(global.app_root, Some(PathBuf::from("/opt/revive")));
        assert_eq!(
            command,
            CliCommand::Restore {
                input: PathBuf::from("old.jpg"),
                output: None,
                params: RestoreParams {
                    outscale: 4.0,
                    face_enhance: false,
                    ..RestoreParams::default()
                },
            }
        );
    }

    #[test]
    fn parses_colorize_stable_with_render_factor() {
        let (_, command) = parse_cli_args(&args(&[
            "colorize",
            "bw.png",
            "--stable",
            "--render-factor",
            "20",
            "--output",
            "out",
        ]))
        .expect("parse");
        assert_eq!(
            command,
            CliCommand::Colorize {
                input: PathBuf::from("bw.png"),
                output: Some(PathBuf::from("out")),
                params: ColorizeParams {
                    artistic: false,
                    render_factor: 20,
                },
            }
        );
    }

    #[test]
    fn batch_requires_engine() {
        let err = parse_cli_args(&args(&["batch", "photos"])).expect_err("missing engine");
        assert!(err.to_string().contains("--engine"));

        let (global, command) = parse_cli_args(&args(&[
            "--settings",
            "custom.toml",
            "batch",
            "photos",
            "--engine",
            "deoldify",
            "--json",
        ]))
        .expect("parse");
        assert_eq!(global.settings_path.as_deref(), Some("custom.toml"));
        assert_eq!(
            command,
            CliCommand::Batch {
                folder: PathBuf::from("photos"),
                engine: EngineKind::Colorize,
                output: None,
                json: true,
            }
        );
    }

    #[test]
    fn check_engine_and_help() {
        let (_, command) = parse_cli_args(&args(&["check-engine", "restore"])).expect("parse");
        assert_eq!(
            command,
            CliCommand::CheckEngine {
                engine: EngineKind::Restore
            }
        );
        assert_eq!(parse_cli_args(&[]).expect("parse").1, CliCommand::Help);
        assert!(parse_cli_args(&args(&["check-engine"])).is_err());
        assert!(parse_cli_args(&args(&["upscale", "x.png"])).is_err());
    }

    #[test]
    fn rejects_unknown_flags_and_missing_values() {
        assert!(parse_cli_args(&args(&["restore", "a.png", "--turbo"])).is_err());
        let err = parse_cli_args(&args(&["restore", "a.png", "--model"])).expect_err("no value");
        assert!(err.to_string().contains("Missing value for --model"));
    }
}
