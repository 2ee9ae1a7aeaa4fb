//! Enroll an OATH token in the validation server's record database.
//!
//! The AEAD blob and nonce come from the trust device's own tooling; this
//! tool only writes the opaque record the validation path will read.

use anyhow::{bail, Context, Result};
use clap::Parser;
use otpval_core::device::SecretRef;
use otpval_core::lexical;
use otpval_store::{OathRecord, OathStore};
use std::path::PathBuf;

/// Initialize an OATH token for use with otpval-server.
#[derive(Debug, Parser)]
#[command(name = "otpval-init-token", version, about)]
struct Args {
    /// Enable verbose operation
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Overwrite any present entry
    #[arg(long)]
    force: bool,

    /// Key handle the AEAD was made under
    #[arg(long = "key-handle", required = true, value_name = "HANDLE")]
    key_handle: String,

    /// User ID
    #[arg(long, required = true, value_name = "STR")]
    uid: String,

    /// Nonce the AEAD was made with, hex encoded
    #[arg(long, required = true, value_name = "HEXSTR")]
    nonce: String,

    /// AEAD blob sealing the token key, hex encoded
    #[arg(long, required = true, value_name = "HEXSTR")]
    aead: String,

    /// Initial OATH counter value
    #[arg(long = "oath-c", default_value_t = 0, value_name = "INT")]
    oath_c: u64,

    /// Record database of the validation server
    #[arg(long = "db-file", default_value = "/var/lib/otpval/records.db", value_name = "FN")]
    db_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let Some(key_handle) = lexical::parse_key_handle(&args.key_handle) else {
        bail!("bad key handle '{}'", args.key_handle);
    };
    let nonce = hex::decode(&args.nonce).context("bad nonce hex")?;
    let aead = hex::decode(&args.aead).context("bad aead hex")?;

    let store = OathStore::open(&args.db_file)
        .await
        .with_context(|| format!("failed opening {}", args.db_file.display()))?;

    let record = OathRecord {
        identity: args.uid.clone(),
        secret: SecretRef {
            key_handle,
            nonce,
            aead,
        },
        counter: args.oath_c,
    };
    if args.force {
        store.delete(&args.uid).await?;
    }
    store
        .add(&record)
        .await
        .with_context(|| format!("failed storing entry for '{}'", args.uid))?;
    if args.verbose {
        println!(
            "stored '{}' (key handle {key_handle}, counter {})",
            args.uid, args.oath_c
        );
    }
    Ok(())
}
