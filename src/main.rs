fn main() -> anyhow::Result<()> {
    lead_desk::run()
}
