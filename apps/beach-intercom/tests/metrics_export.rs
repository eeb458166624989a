use anyhow::Result;
use beach_intercom::{server::build_router, Relay, RelaySettings};
use intercom_proto::Role;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tokio::net::TcpListener;

// Installs the process-global recorder, so this file holds a single test.
#[test_timeout::tokio_timeout_test(30)]
async fn relay_counters_reach_the_prometheus_endpoint() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let relay = Relay::new(RelaySettings::default());
    let (caller, _caller_rx) = relay.connect(Role::Caller);
    let offer = json!({"type": "offer", "from": "caller", "to": "callee", "payload": "SDP1"});
    relay.ingest(Role::Caller, caller.id(), &offer.to_string())?;

    let rendered = handle.render();
    assert!(rendered.contains("intercom_endpoints_connected 1"), "{rendered}");
    assert!(
        rendered.contains("intercom_envelopes_dropped_total{reason=\"peer_offline\"} 1"),
        "{rendered}"
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = build_router(relay, Some(handle));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let body = reqwest::get(format!("http://{addr}/metrics"))
        .await?
        .text()
        .await?;
    assert!(body.contains("intercom_endpoints_connected"), "{body}");
    Ok(())
}
