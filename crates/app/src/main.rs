mod cli;
mod counting;
mod zones;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    cli::handle_commands(std::env::args_os())
}
