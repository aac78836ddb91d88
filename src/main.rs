fn main() {
    wasmgen::projects::cli::start_cli();
}
