//! Identity subsystem properties: round-trips, tampering, exclusivity.

use commune::identity::{AgentCertificate, IdentityManager};
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn certificate_survives_disk_round_trip() -> anyhow::Result<()> {
    let manager = IdentityManager::new(24);
    let cert = manager
        .claim("roundtrip", false)
        .ok_or_else(|| anyhow::anyhow!("fresh claim refused"))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("roundtrip.cert");
    std::fs::write(&path, cert.to_json()?)?;

    let loaded = AgentCertificate::from_json(&std::fs::read_to_string(&path)?)?;
    assert_eq!(loaded, cert);
    assert!(manager.validate(&loaded));
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_yield_exactly_one_certificate() {
    let manager = Arc::new(IdentityManager::new(24));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.claim("contested", false).is_some()
        }));
    }
    let mut issued = 0;
    for handle in handles {
        if handle.await.expect("join") {
            issued += 1;
        }
    }
    assert_eq!(issued, 1);
}

#[test]
fn release_then_reclaim_issues_fresh_certificate() {
    let manager = IdentityManager::new(24);
    let first = manager.claim("cycling", false).expect("first claim");
    manager.release("cycling");
    let second = manager.claim("cycling", false).expect("second claim");
    assert_ne!(first.signature, second.signature);
    assert!(!manager.validate(&first));
    assert!(manager.validate(&second));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any tampering with the signed fields breaks validation.
    #[test]
    fn tampered_certificates_never_validate(
        agent_suffix in "[a-z]{1,8}",
        expires_delta in 1.0f64..100_000.0,
        issued_delta in 1.0f64..100_000.0,
    ) {
        let manager = IdentityManager::new(24);
        let agent_id = format!("agent-{agent_suffix}");
        let cert = manager.claim(&agent_id, false).expect("claim");

        let mut wrong_agent = cert.clone();
        wrong_agent.agent_id = format!("{}-evil", wrong_agent.agent_id);
        prop_assert!(!manager.validate(&wrong_agent));

        let mut extended = cert.clone();
        extended.expires_at += expires_delta;
        prop_assert!(!manager.validate(&extended));

        let mut backdated = cert.clone();
        backdated.issued_at -= issued_delta;
        prop_assert!(!manager.validate(&backdated));

        // The untouched certificate still validates.
        prop_assert!(manager.validate(&cert));
    }

    /// Hex-garbled signatures fail closed, never panic.
    #[test]
    fn garbled_signature_fails_closed(garbage in "[0-9a-f]{0,128}") {
        let manager = IdentityManager::new(24);
        let cert = manager.claim("garble", false).expect("claim");
        let mut tampered = cert.clone();
        if tampered.signature == garbage {
            return Ok(());
        }
        tampered.signature = garbage;
        prop_assert!(!manager.validate(&tampered));
    }
}
