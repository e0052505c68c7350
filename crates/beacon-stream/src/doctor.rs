use anyhow::Result;

pub fn check_endpoint(endpoint: &str) -> Result<()> {
    let ep = endpoint
        .strip_prefix("tls://")
        .ok_or_else(|| anyhow::anyhow!("sink.endpoint must start with tls://: {}", endpoint))?;
    let mut parts = ep.split(':');
    let host = parts.next().unwrap_or("");
    anyhow::ensure!(!host.is_empty(), "sink.endpoint missing host: {}", endpoint);
    let port = parts.next().unwrap_or("");
    anyhow::ensure!(
        port.parse::<u16>().map(|p| p > 0).unwrap_or(false),
        "sink.endpoint has no valid port: {}",
        endpoint
    );
    Ok(())
}

pub fn check_stream_params(
    min_distance_m: f64,
    batch_interval_ms: u64,
    reconnect_delay_s: u64,
) -> Result<()> {
    anyhow::ensure!(min_distance_m > 0.0, "stream.min_distance_m must be positive");
    anyhow::ensure!(
        batch_interval_ms >= 1000,
        "stream.batch_interval_ms < 1s would defeat batching"
    );
    anyhow::ensure!(
        (1..=600).contains(&reconnect_delay_s),
        "stream.reconnect_delay_s should be 1..600"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        assert!(check_endpoint("tls://store.example.com:7443").is_ok());
        assert!(check_endpoint("http://store.example.com").is_err());
        assert!(check_endpoint("tls://store.example.com:0").is_err());
        assert!(check_endpoint("tls://store.example.com:notaport").is_err());
    }

    #[test]
    fn stream_param_validation() {
        assert!(check_stream_params(50.0, 10_000, 10).is_ok());
        assert!(check_stream_params(0.0, 10_000, 10).is_err());
        assert!(check_stream_params(50.0, 100, 10).is_err());
        assert!(check_stream_params(50.0, 10_000, 0).is_err());
    }
}
