//! Token command implementation.

use mobisync_server::TokenCodec;
use serde::Serialize;

/// Decoded content of a sync token.
#[derive(Debug, Serialize)]
pub struct TokenReport {
    /// Device the token was issued to.
    pub device_id: String,
    /// Data type the token covers.
    pub data_type: String,
    /// Update time of the last entity sent, if any.
    pub updated_at: Option<String>,
    /// Id of the last entity sent, if any.
    pub entity_id: Option<u64>,
}

/// Runs the token command.
pub fn run(token: &str, secret: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = inspect(token, secret)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("device:    {}", report.device_id);
            println!("data type: {}", report.data_type);
            match (&report.updated_at, report.entity_id) {
                (Some(at), Some(id)) => println!("watermark: {at} / #{id}"),
                _ => println!("watermark: beginning of time"),
            }
        }
    }

    Ok(())
}

fn inspect(token: &str, secret: &str) -> Result<TokenReport, Box<dyn std::error::Error>> {
    let info = TokenCodec::new(secret.as_bytes().to_vec()).inspect(token.trim())?;
    Ok(TokenReport {
        device_id: info.device_id,
        data_type: info.data_type.to_string(),
        updated_at: info.watermark.map(|w| w.updated_at.to_rfc3339()),
        entity_id: info.watermark.map(|w| w.entity_id.as_u64()),
    })
}
