use anyhow::{bail, Result};
use courier::harness::ModuleRunner;
use courier::library::communication::implementation::amqp::AmqpBroker;
use courier::module::call::Call;
use courier::module::serve::Serve;
use options::{Command, LogFormat};
use structopt::StructOpt;
use tracing::info;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init();

    let reason = match command {
        Command::Serve(options) => {
            let broker = AmqpBroker::new(options.broker.amqp_uri()).with_connection_name("courier-serve");
            runner.run(Serve::new(options, broker)).await
        }
        Command::Call(options) => {
            let broker = AmqpBroker::new(options.broker.amqp_uri()).with_connection_name("courier-call");
            runner.run(Call::new(options, broker)).await
        }
    };

    if !reason.is_success() {
        bail!(reason);
    }

    Ok(())
}

fn init() -> (Command, ModuleRunner) {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt().with_env_filter(options.log);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("Courier {}", env!("CARGO_PKG_VERSION"));

    (options.command, ModuleRunner::default())
}
