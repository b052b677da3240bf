fn main() -> anyhow::Result<()> {
    perftester::cli::execute()
}
