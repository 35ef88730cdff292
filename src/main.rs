fn main() -> anyhow::Result<()> {
    loja_pos_lib::run()
}
