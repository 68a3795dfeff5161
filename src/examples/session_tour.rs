//! Session Tour Example
//!
//! Logs in to an ICAT server, runs a few catalog operations and logs out.
//! Point it at a test server, never a production catalog.
//!
//! Run with: ICAT_URL=https://localhost:8181 cargo run --example session_tour

use std::collections::HashMap;

use icat_rs::Icat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("ICAT_URL").unwrap_or_else(|_| "https://localhost:8181".to_string());
    let icat = Icat::new(&url)?;
    println!("Server version: {}", icat.get_version().await?);

    let credentials = HashMap::from([
        ("username".to_string(), "root".to_string()),
        ("password".to_string(), "password".to_string()),
    ]);
    let session = icat.login("db", &credentials).await?;
    println!("Logged in as {}", session.get_user_name().await?);
    println!("Minutes remaining: {:.1}", session.get_remaining_minutes().await?);

    let ids = session
        .write(r#"{"Facility":{"name":"Tour Facility"}}"#)
        .await?;
    println!("Created Facility with id {}", ids[0]);

    let facility = session.get("Facility", ids[0]).await?;
    println!("Fetched: {facility}");

    session
        .delete(&format!(r#"{{"Facility":{{"id":{}}}}}"#, ids[0]))
        .await?;
    session.logout().await?;
    println!("Logged out");
    Ok(())
}
