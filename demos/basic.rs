use resilient_http::{HttpClient, Method, RequestDescriptor, RetryOverrides};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resilient_http=debug")),
        )
        .init();

    let http = HttpClient::from_env().map_err(anyhow::Error::msg)?;
    let url = std::env::var("RESILIENT_HTTP_DEMO_URL")
        .unwrap_or_else(|_| "https://httpbin.org/status/503,200".to_owned());

    let outcome = http
        .request(
            RequestDescriptor::new(Method::Get, url)
                .header("accept", "application/json")
                .retry(RetryOverrides::default().max_retries(4).base_delay_ms(250)),
        )
        .await;

    match outcome {
        Ok(response) => println!(
            "{} {} after {} retries in {}ms",
            response.status, response.status_text, response.metrics.retry_count, response.duration
        ),
        Err(err) => println!(
            "failed: {err} (status {:?}, retryable {})",
            err.status(),
            err.is_retryable()
        ),
    }

    println!("{}", serde_json::to_string_pretty(&http.red_metrics())?);
    Ok(())
}
