use coreclaw::config::Settings;
use coreclaw::runtime::{run_until_stopped, Core};
use std::path::PathBuf;

fn output_header() -> &'static str {
    "CoreClaw core\nSingle-host orchestration service for sandboxed AI communication workers."
}

fn run() -> Result<(), String> {
    println!("{}\n", output_header());

    let mut args = std::env::args().skip(1);
    let mut settings_path: Option<PathBuf> = None;
    let mut state_root: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                settings_path = Some(PathBuf::from(
                    args.next().ok_or("--config requires a path")?,
                ));
            }
            "--state-root" => {
                state_root = Some(PathBuf::from(
                    args.next().ok_or("--state-root requires a path")?,
                ));
            }
            other => return Err(format!("unknown argument `{other}`")),
        }
    }

    let mut settings = match settings_path {
        Some(path) => Settings::load(&path).map_err(|err| err.to_string())?,
        None => Settings::default(),
    };
    if let Some(root) = state_root {
        settings.state_root = root;
    }
    if settings.state_root.as_os_str().is_empty() {
        settings.state_root = PathBuf::from("coreclaw-state");
    }

    let core = Core::new(settings).map_err(|err| err.to_string())?;
    println!(
        "state root: {}\nstop with: touch {}",
        core.settings().state_root.display(),
        coreclaw::runtime::stop_signal_path(&core.settings().state_root).display()
    );
    run_until_stopped(&core).map_err(|err| err.to_string())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
