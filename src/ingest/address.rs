//! Address resolution.
//!
//! Network addresses look like `15551234567:12@s.whatsapp.net` (phone-number
//! user, optional device suffix) or `8123456789@lid` (an opaque linked-device
//! id). Both resolve to a canonical `+<digits>` address; linked-device ids go
//! through a mapping learned from protocol attributes.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::transport::RawMessage;

const PHONE_DOMAINS: &[&str] = &["s.whatsapp.net", "c.us"];
const LID_DOMAIN: &str = "lid";

/// Attribute pairs `(lid attribute, phone attribute)` that reveal a mapping.
const ALIAS_ATTRIBUTES: &[(&str, &str)] = &[
    ("sender_lid", "sender_pn"),
    ("participant_lid", "participant_pn"),
    ("remote_lid", "remote_pn"),
];

/// Split an address into `(user, domain)` with any device suffix removed.
fn split(address: &str) -> (&str, Option<&str>) {
    let (user, domain) = match address.split_once('@') {
        Some((user, domain)) => (user, Some(domain)),
        None => (address, None),
    };
    let user = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
    (user, domain)
}

/// Canonical phone address for a phone-number address, or `None` for
/// anything else.
pub fn canonical_phone(address: &str) -> Option<String> {
    let address = address.trim();
    let (user, domain) = split(address);
    if let Some(domain) = domain {
        if !PHONE_DOMAINS.contains(&domain) {
            return None;
        }
    }
    let digits = user.trim_start_matches('+');
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{}", digits))
}

fn is_lid(address: &str) -> bool {
    split(address).1 == Some(LID_DOMAIN)
}

fn lid_key(address: &str) -> String {
    split(address).0.to_string()
}

/// Per-agent resolver holding the learned linked-device mapping.
#[derive(Default)]
pub struct AddressResolver {
    lids: RwLock<HashMap<String, String>>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record any linked-device mapping revealed by an event. Called for
    /// every event, including ones later filtered out.
    pub async fn learn(&self, raw: &RawMessage) {
        let pn_of = |attr: &str| raw.attributes.get(attr).and_then(|pn| canonical_phone(pn));
        let mut learned = Vec::new();

        for (lid_attr, pn_attr) in ALIAS_ATTRIBUTES {
            if let (Some(lid), Some(pn)) = (raw.attributes.get(*lid_attr), pn_of(*pn_attr)) {
                learned.push((lid_key(lid), pn));
            }
        }

        // The chat address itself may be the linked-device id. The sender is
        // the peer only when the message was not sent by us.
        if is_lid(&raw.remote) {
            let peer_pn = pn_of("remote_pn").or_else(|| {
                if raw.from_me {
                    None
                } else {
                    pn_of("sender_pn")
                }
            });
            if let Some(pn) = peer_pn {
                learned.push((lid_key(&raw.remote), pn));
            }
        }
        if let (Some(participant), Some(pn)) = (
            raw.participant.as_deref().filter(|p| is_lid(p)),
            pn_of("participant_pn"),
        ) {
            learned.push((lid_key(participant), pn));
        }

        if learned.is_empty() {
            return;
        }
        let mut lids = self.lids.write().await;
        for (lid, pn) in learned {
            if lids.get(&lid) != Some(&pn) {
                tracing::debug!(lid = %lid, address = %pn, "Learned linked-device mapping");
                lids.insert(lid, pn);
            }
        }
    }

    /// Canonical address for any network address. Unmapped linked-device ids
    /// resolve to `lid:<id>` so they stay distinguishable.
    pub async fn resolve(&self, address: &str) -> String {
        if is_lid(address) {
            let key = lid_key(address);
            return match self.lids.read().await.get(&key) {
                Some(pn) => pn.clone(),
                None => {
                    tracing::debug!(lid = %key, "Linked-device id not yet mapped");
                    format!("lid:{}", key)
                }
            };
        }
        canonical_phone(address).unwrap_or_else(|| address.trim().to_string())
    }
}
