//! Example: List the keys in your gpg keyring
//!
//! Run with: cargo run --example list_keys [pattern]

use gpg_keysign::{Key, KeyValidity, Keyring};

#[tokio::main]
async fn main() -> gpg_keysign::Result<()> {
    let pattern = std::env::args().nth(1);
    let keyring = Keyring::new();

    let Some(keys) = keyring.get_keys(pattern.as_deref(), true, true).await? else {
        println!("No matching keys");
        return Ok(());
    };

    println!("Found {} keys\n", keys.len());

    for key in keys.values() {
        println!("{}", format_key_output(key));
    }

    Ok(())
}

fn format_key_output(key: &Key) -> String {
    let validity_marker = match key.validity {
        KeyValidity::Ultimate => "[U]",
        KeyValidity::Full => "[F]",
        KeyValidity::Marginal => "[M]",
        KeyValidity::Never => "[N]",
        KeyValidity::Undefined => "[?]",
        KeyValidity::Unknown => "[-]",
        KeyValidity::Expired => "[E]",
        KeyValidity::Revoked => "[R]",
        _ => "[?]",
    };

    let secret = if key.secret { " (secret)" } else { "" };
    let expires = key
        .expires()
        .map(|d| format!(" expires {}", d.date_naive()))
        .unwrap_or_default();
    let uids: Vec<&str> = key.uids.iter().map(|u| u.uid.as_str()).collect();

    format!(
        "{} {}{}{}\n    {}",
        validity_marker,
        key.short_id(16),
        secret,
        expires,
        uids.join("\n    ")
    )
}
