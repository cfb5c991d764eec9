use std::env;

use anyhow::Result;
use tracing::{dispatcher, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer, Registry,
};

fn try_init_once_tracing(export: bool) -> Result<()> {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return Ok(());
    }

    // Set default service name
    {
        const SERVICE_NAME_KEY: &str = "OTEL_SERVICE_NAME";
        const SERVICE_NAME_VALUE: &str = env!("CARGO_CRATE_NAME");

        if env::var_os(SERVICE_NAME_KEY).is_none() {
            env::set_var(SERVICE_NAME_KEY, SERVICE_NAME_VALUE);
        }
    }

    fn init_layer_env_filter<S>() -> impl Layer<S>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        ::tracing_subscriber::EnvFilter::from_default_env()
    }

    fn init_layer_stdfmt<S>() -> impl Layer<S>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        ::tracing_subscriber::fmt::layer()
    }

    #[cfg(feature = "otlp")]
    fn init_layer_otlp_tracer<S>() -> Result<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        use opentelemetry_otlp as otlp;
        use opentelemetry_sdk::runtime::Tokio as Runtime;

        otlp::new_pipeline()
            .tracing()
            .with_exporter(otlp::new_exporter().tonic())
            .install_batch(Runtime)
            .map(::tracing_opentelemetry::OpenTelemetryLayer::new)
            .map_err(|error| ::anyhow::anyhow!("failed to init a tracer: {error}"))
    }

    let layer = Registry::default()
        .with(init_layer_env_filter())
        .with(init_layer_stdfmt());

    if export {
        #[cfg(feature = "otlp")]
        let layer = layer.with(init_layer_otlp_tracer()?);

        layer.try_init().map_err(Into::into)
    } else {
        layer.try_init().map_err(Into::into)
    }
}

pub fn try_init_once() -> Result<()> {
    try_init_once_with_default(cfg!(feature = "otlp"))
}

pub fn try_init_once_with_default(export: bool) -> Result<()> {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return Ok(());
    }

    // set default tracing level
    if env::var_os(KEY).is_none() {
        env::set_var(KEY, "INFO");
    }

    try_init_once_tracing(export)
}

const KEY: &str = "RUST_LOG";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        try_init_once_with_default(false).expect("first init should succeed");
        assert!(dispatcher::has_been_set());
        try_init_once_with_default(false).expect("second init should be skipped");
    }
}
