use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    conduit::cli::main()
}
