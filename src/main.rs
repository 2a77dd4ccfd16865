fn main() {
    // hand over control to the CLI parser immediately
    servedir::cli::execute();
}
