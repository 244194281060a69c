// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 Session Test CLI
//!
//! A simple CLI tool to test session authorization on real hardware.
//!
//! Usage:
//!   tpm2-auth-test [command] [handle]
//!
//! Commands:
//!   info        - Show TPM device info
//!   random      - GetRandom through an unsalted HMAC session, response encrypted
//!   salted      - GetRandom through a session salted to [handle] (default 0x81000001)
//!   nv-public   - NV_ReadPublic of [handle] through an HMAC session
//!   all         - Run all tests
//!
//! Session state lives in `TPM_DATA_DIR` (default: a temporary directory).

use std::env;
use tpm2_auth::{
    tpm_rh, SessionOptions, SessionSlot, TpmaSa, TpmtSymDef, Tss, TssConfig, TpmAlgId,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("all");
    let handle = args
        .get(2)
        .and_then(|h| u32::from_str_radix(h.trim_start_matches("0x"), 16).ok());

    println!("=== TPM 2.0 Session Test Tool ===\n");

    match command {
        "info" => test_info(),
        "random" => test_random(),
        "salted" => test_salted(handle.unwrap_or(0x81000001)),
        "nv-public" => test_nv_public(handle.unwrap_or(0x01c00002)),
        "all" => {
            test_info();
            test_random();
            test_salted(handle.unwrap_or(0x81000001));
            test_nv_public(0x01c00002);
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Available commands: info, random, salted, nv-public, all");
            std::process::exit(1);
        }
    }
}

fn config() -> anyhow::Result<TssConfig> {
    let mut config = TssConfig::from_env()?;
    if env::var_os("TPM_DATA_DIR").is_none() {
        config.data_dir = env::temp_dir().join("tpm2-auth-test");
    }
    Ok(config)
}

fn open() -> Option<Tss> {
    match config().and_then(|c| Tss::new(&c)) {
        Ok(tss) => Some(tss),
        Err(e) => {
            println!("✗ Failed to open TPM: {:#}", e);
            None
        }
    }
}

fn encrypting_slot(handle: u32) -> SessionSlot {
    SessionSlot::session(handle)
        .with_attributes(TpmaSa::new().with_continue_session().with_encrypt())
}

fn test_info() {
    println!("--- Test: Device Info ---");

    let config = match config() {
        Ok(config) => config,
        Err(e) => {
            println!("✗ Bad configuration: {:#}", e);
            return;
        }
    };
    match tpm2_auth::TpmDevice::open_or_detect(config.device.as_deref()) {
        Ok(dev) => {
            println!("✓ TPM device opened: {}", dev.path());
            println!("  Data directory: {}", config.data_dir.display());
        }
        Err(e) => {
            println!("✗ Failed to open TPM device: {:#}", e);
        }
    }
    println!();
}

fn test_random() {
    println!("--- Test: HMAC Session ---");

    let Some(mut tss) = open() else {
        return;
    };

    let session = match tss.start_auth_session(&SessionOptions::hmac()) {
        Ok(handle) => {
            println!("✓ Started HMAC session 0x{:08x}", handle);
            handle
        }
        Err(e) => {
            println!("✗ StartAuthSession failed: {:#}", e);
            return;
        }
    };

    // Last use closes the session
    for (i, slot) in [
        encrypting_slot(session),
        SessionSlot::session(session).with_attributes(TpmaSa::new().with_encrypt()),
    ]
    .into_iter()
    .enumerate()
    {
        match tss.get_random(32, &[slot]) {
            Ok(bytes) => {
                println!("✓ Round {}: 32 random bytes, response decrypted:", i + 1);
                println!("  {}", hex::encode(&bytes));
            }
            Err(e) => {
                println!("✗ GetRandom failed: {:#}", e);
                let _ = tss.flush_context(session);
                return;
            }
        }
    }
    println!();
}

fn test_salted(key: u32) {
    println!("--- Test: Salted Session ---");

    let Some(mut tss) = open() else {
        return;
    };

    let options = SessionOptions::hmac()
        .salted(key)
        .symmetric(TpmtSymDef::xor(TpmAlgId::Sha256));
    let session = match tss.start_auth_session(&options) {
        Ok(handle) => {
            println!("✓ Started session 0x{:08x} salted to 0x{:08x}", handle, key);
            handle
        }
        Err(e) => {
            println!("✗ StartAuthSession (salted) failed: {:#}", e);
            return;
        }
    };

    let slot = SessionSlot::session(session).with_attributes(TpmaSa::new().with_encrypt());
    match tss.get_random(16, &[slot]) {
        Ok(bytes) => println!("✓ XOR-encrypted GetRandom: {}", hex::encode(&bytes)),
        Err(e) => println!("✗ GetRandom failed: {:#}", e),
    }
    println!();
}

fn test_nv_public(index: u32) {
    println!("--- Test: NV_ReadPublic ---");

    let Some(mut tss) = open() else {
        return;
    };

    let session = match tss.start_auth_session(&SessionOptions::hmac().bound(tpm_rh::OWNER, None)) {
        Ok(handle) => handle,
        Err(e) => {
            println!("✗ StartAuthSession failed: {:#}", e);
            return;
        }
    };

    let slot = SessionSlot::session(session).with_attributes(TpmaSa::new().with_encrypt());
    match tss.nv_read_public(index, &[slot]) {
        Ok(public) => {
            println!("✓ NV index 0x{:08x}:", index);
            println!("  Attributes: 0x{:08x}", public.attributes.0);
            println!("  Size: {} bytes", public.data_size);
            println!("  Name alg: {:?}", public.name_alg);
        }
        Err(e) => {
            println!("✗ NV_ReadPublic failed: {:#}", e);
        }
    }
    println!();
}
