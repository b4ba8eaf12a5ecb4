use std::time::Duration;

use anyhow::{Context, Result};

use super::*;
use crate::fixtures;

#[test]
fn join_url_encodes_segments() -> Result<()> {
    let url = join_url("http://localhost:48071", &["api", "v1", "registration", "name", "my reg/1"])?;
    assert_eq!(url.as_str(), "http://localhost:48071/api/v1/registration/name/my%20reg%2F1");

    let url = join_url("http://localhost:48080/", &["api", "v1", "event", "id", "abc"])?;
    assert_eq!(url.as_str(), "http://localhost:48080/api/v1/event/id/abc", "expected a trailing slash not to double up");

    assert!(join_url("not a url", &["api"]).is_err(), "expected an invalid base URL to be refused");
    Ok(())
}

#[tokio::test]
async fn http_store_fetches_registrations() -> Result<()> {
    let regs = vec![fixtures::registration("reg-a", &["DEV1"]), fixtures::registration("reg-b", &[])];
    let addr = fixtures::spawn_store_server(regs.clone()).await?;
    let store = HttpRegistrationStore::new(reqwest::Client::new(), format!("http://{}", addr));

    let all = store.get_all().await?;
    assert_eq!(all, regs, "expected all registrations to be returned");

    let found = store.get_by_name("reg-b").await?;
    assert_eq!(found.as_ref(), Some(&regs[1]), "expected reg-b to be found");

    let missing = store.get_by_name("reg-c").await?;
    assert!(missing.is_none(), "expected a 404 to map to no registration, got {:?}", missing);

    Ok(())
}

#[tokio::test]
async fn http_store_reports_unreachable_store() -> Result<()> {
    // Nothing listens on the discard port.
    let store = HttpRegistrationStore::new(reqwest::Client::new(), "http://127.0.0.1:9");
    assert!(store.get_all().await.is_err(), "expected an unreachable store to be an error");
    Ok(())
}

#[tokio::test]
async fn http_acker_marks_events_by_id_and_checksum() -> Result<()> {
    let (addr, mut requests) = fixtures::spawn_http_recorder(200).await?;
    let acker = HttpEventAcker::new(reqwest::Client::new(), format!("http://{}", addr));

    acker.mark_pushed("event-1").await?;
    acker.mark_pushed_by_checksum("abc123").await?;

    let first = tokio::time::timeout(Duration::from_secs(5), requests.recv()).await.context("timeout")?.context("recorder closed")?;
    assert_eq!(first.method, "PUT");
    assert_eq!(first.path, "/api/v1/event/id/event-1");

    let second = tokio::time::timeout(Duration::from_secs(5), requests.recv()).await.context("timeout")?.context("recorder closed")?;
    assert_eq!(second.method, "PUT");
    assert_eq!(second.path, "/api/v1/event/checksum/abc123");

    Ok(())
}

#[tokio::test]
async fn http_acker_reports_failure_statuses() -> Result<()> {
    let (addr, _requests) = fixtures::spawn_http_recorder(404).await?;
    let acker = HttpEventAcker::new(reqwest::Client::new(), format!("http://{}", addr));

    assert!(acker.mark_pushed("event-1").await.is_err(), "expected a 404 to be an error");

    Ok(())
}
