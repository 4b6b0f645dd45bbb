fn main() -> anyhow::Result<()> {
    fleetbench_coordinator::cli::execute()
}
