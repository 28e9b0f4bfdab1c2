fn main() {
    if let Err(err) = solar_audit::app::run_audit_job() {
        eprintln!("audit job failed: {err}");
        std::process::exit(1);
    }
}
