use tracing::Level;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Install the fmt subscriber. Logs go to stderr; stdout belongs to the guest.
pub fn init_tracing() -> anyhow::Result<()> {
    let envfilter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?
        .add_directive("cranelift_codegen=warn".parse()?)
        .add_directive("wasmtime_cranelift=warn".parse()?);

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(std::io::stderr)
                .with_filter(envfilter),
        )
        .try_init()?;
    Ok(())
}
