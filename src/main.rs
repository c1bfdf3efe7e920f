use smart_report::CliError;

fn is_robot_mode_args() -> bool {
    std::env::args().any(|arg| arg == "--json" || arg == "--robot")
}

fn report(err: &CliError) {
    if is_robot_mode_args() {
        let payload = serde_json::json!({ "error": err });
        eprintln!("{payload}");
    } else {
        eprintln!("{}", err.message);
        if let Some(hint) = &err.hint {
            eprintln!("hint: {hint}");
        }
    }
}

fn main() {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let cli = match smart_report::parse_cli(std::env::args()) {
        Ok(cli) => cli,
        Err(err) if err.code == 0 => {
            print!("{}", err.message);
            return;
        }
        Err(err) => {
            report(&err);
            std::process::exit(err.code);
        }
    };

    smart_report::init_tracing();

    if let Err(err) = smart_report::run(cli) {
        report(&err);
        std::process::exit(err.code);
    }
}
