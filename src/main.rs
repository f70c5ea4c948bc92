fn main() -> anyhow::Result<()> {
    the_small_kds_lib::run()
}
