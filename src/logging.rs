use colored::Colorize;

pub fn print_banner(title: &str, color: fn(&str) -> colored::ColoredString) {
    let border = "╔═══════════════════════════════════════════════════════════════╗";
    let bottom = "╚═══════════════════════════════════════════════════════════════╝";

    println!("{}", color(border));
    println!("{}", color(&format!("║{:^63}║", title)));
    println!("{}", color(bottom));
}

/// Initializes env_logger with an info default so the appliance logs
/// something useful out of the box. RUST_LOG still wins when set.
pub fn setup_logging() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();
}
