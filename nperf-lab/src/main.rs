fn main() -> anyhow::Result<()> {
    nperf_lab::run()
}
