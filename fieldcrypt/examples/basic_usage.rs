//! Basic usage example for `fieldcrypt`: encrypt a command, then decrypt it,
//! answering key queries from a file key vault.

use fieldcrypt::prelude::*;
use fieldcrypt_key_file::FileKeyVault;
use tempfile::TempDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("fieldcrypt Basic Usage Example");
    println!("==============================\n");

    let dir = TempDir::new()?;
    let mut vault = FileKeyVault::init(dir.path().join("keys.json"))?;
    let key_id = vault.generate_key(&["payroll".to_string()], None)?;
    println!("✓ Generated data key {key_id} (alt name \"payroll\")\n");

    let ctx = Context::new(Options::new("file://keys.json"))?;

    let schema = Schema::from_slice(
        br#"{
            "filter": {
                "name": {"$encrypt": {"algorithm": "Random", "keyAltName": "payroll"}},
                "ssn": {"$encrypt": {"algorithm": "Deterministic", "keyAltName": "payroll"}}
            }
        }"#,
    )?;
    let command = br#"{"find":"test","filter":{"name":"Todd Davis","ssn":"457-55-5642"}}"#;

    // Encrypt: the request suspends until its key queries are answered.
    let mut request = ctx.start_encrypt(&schema, command)?;
    while let Some(query) = request.next_key_query() {
        println!("Key query #{} on {}: {}", query.sequence(), query.namespace(), query.filter());
        let applied = request.add_keys(vault.find(&query))?;
        println!("✓ Applied {applied} key record(s)");
    }
    let encrypted = request.finish()?;
    println!("\nEncrypted command:\n{}\n", String::from_utf8_lossy(&encrypted));

    // Decrypt: the key is already cached, so no queries are needed.
    let mut request = ctx.start_decrypt(&encrypted)?;
    println!("Decrypt request needs keys: {}", request.needs_keys());
    let decrypted = request.finish()?;
    println!("Decrypted command:\n{}\n", String::from_utf8_lossy(&decrypted));

    assert_eq!(decrypted, command.to_vec());
    println!("✓ Round trip matches the original command");

    ctx.teardown();
    Ok(())
}
