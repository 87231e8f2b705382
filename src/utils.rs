// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Mutex;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::{RngExt, SeedableRng, rngs::StdRng};

/// Source of the random material the protocol needs: per-frame masking keys
/// on the connecting side and the 16-byte `Sec-WebSocket-Key` nonce.
///
/// Seedable through config so test runs are reproducible.
#[derive(Debug)]
pub struct Entropy {
    rng: Mutex<StdRng>,
}

impl Entropy {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// A fresh 4-byte masking key.
    pub fn mask_key(&self) -> [u8; 4] {
        let mut key = [0u8; 4];
        self.lock().fill(&mut key);
        key
    }

    /// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
    pub fn ws_key(&self) -> String {
        let mut nonce = [0u8; 16];
        self.lock().fill(&mut nonce);
        BASE64.encode(nonce)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StdRng> {
        match self.rng.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
