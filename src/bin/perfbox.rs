use anyhow::Result;

fn main() -> Result<()> {
    perfbox::cli::run()
}
