fn main() {
    if let Err(err) = solar_audit::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
