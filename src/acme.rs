/**
 * Copyright (c) 2024-2025 Glaive, Inc.
 *
 * This file is part of Glaive Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! ACME HTTP-01 challenge handler interface. Issuing and renewing
//! certificates is out of scope here; this module only defines the seam the
//! L7 pipeline calls into so a real issuer can be plugged in later without
//! touching the request path.

use std::collections::HashMap;
use std::sync::RwLock;

/// Serves `/.well-known/acme-challenge/<token>` responses. An issuer
/// implementation populates `tokens` as it negotiates challenges; the
/// gateway only needs to answer them.
pub trait ChallengeHandler: Send + Sync {
    fn respond(&self, token: &str) -> Option<String>;
}

#[derive(Default)]
pub struct InMemoryChallengeHandler {
    tokens: RwLock<HashMap<String, String>>,
}

impl InMemoryChallengeHandler {
    pub fn set_challenge(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens.write().unwrap().insert(token.into(), key_authorization.into());
    }

    pub fn clear_challenge(&self, token: &str) {
        self.tokens.write().unwrap().remove(token);
    }
}

impl ChallengeHandler for InMemoryChallengeHandler {
    fn respond(&self, token: &str) -> Option<String> {
        self.tokens.read().unwrap().get(token).cloned()
    }
}

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responds_with_registered_key_authorization() {
        let handler = InMemoryChallengeHandler::default();
        handler.set_challenge("token123", "key-auth-value");
        assert_eq!(handler.respond("token123"), Some("key-auth-value".to_string()));
    }

    #[test]
    fn unknown_token_returns_none() {
        let handler = InMemoryChallengeHandler::default();
        assert_eq!(handler.respond("missing"), None);
    }

    #[test]
    fn cleared_challenge_is_no_longer_answered() {
        let handler = InMemoryChallengeHandler::default();
        handler.set_challenge("t", "v");
        handler.clear_challenge("t");
        assert_eq!(handler.respond("t"), None);
    }
}
