fn main() {
    if let Err(message) = coreward_lib::run() {
        eprintln!("{}", message);
        std::process::exit(2);
    }
}
