/// # Command line front end for the backend
/// Builds and checks IR scripts, writing the module text, binary and layout report.
pub mod cli;
