// Copyright (c) 2024 Botho Foundation

use anyhow::Result;

use crate::crypto::EdgeKey;

/// Run the keygen command
pub fn run() -> Result<()> {
    let key = EdgeKey::random(&mut rand::rngs::OsRng);
    let (key_hex, iv_hex) = key.to_hex();

    println!("[keys]");
    println!("key = \"{}\"", key_hex);
    println!("iv = \"{}\"", iv_hex);
    Ok(())
}
