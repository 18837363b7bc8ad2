fn main() -> std::process::ExitCode {
    ipcoder_cli::run()
}
