use resilient_http::{ClientOptions, HttpClient, Method, RequestDescriptor};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resilient_http=debug")),
        )
        .init();

    let url = std::env::var("RESILIENT_HTTP_DEMO_URL")
        .unwrap_or_else(|_| "https://httpbin.org/delay/1".to_owned());
    let http = HttpClient::from_options(ClientOptions {
        reaper_interval_ms: Some(5_000),
        ..ClientOptions::default()
    });

    // Three fragments submit the same checkout; only one POST leaves the process.
    let checkout = || {
        RequestDescriptor::new(Method::Post, url.as_str())
            .json(json!({"cart": "c-42", "total": 1999}))
            .idempotency_key("checkout-c-42")
    };
    let (header, sidebar, summary) = tokio::join!(
        http.request(checkout()),
        http.request(checkout()),
        http.request(checkout())
    );

    for (fragment, outcome) in [("header", header), ("sidebar", sidebar), ("summary", summary)] {
        match outcome {
            Ok(response) => println!(
                "{fragment}: {} via {}",
                response.status, response.metrics.request_id
            ),
            Err(err) => println!("{fragment}: {err}"),
        }
    }
    println!("requests recorded: {}", http.metrics().len());

    let flushed = http.shutdown().await;
    println!("in-flight at shutdown: {flushed}");
    Ok(())
}
