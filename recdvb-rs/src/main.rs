fn main() {
    let status = recdvb::run_cli();
    std::process::exit(status.code());
}
