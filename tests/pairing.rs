use std::sync::Arc;

use kinlink::{
    clock::Clock,
    db::{AccountRole, ElderProfile, Relationship},
    error::SignalError,
    pairing::{Claim, ClaimStatus, Issuer},
    testing::Harness,
};

#[tokio::test]
async fn code_expires_after_ten_minutes() {
    let h = Harness::new().await;
    let family = h.db.create_user("daughter", AccountRole::Family, h.clock.now()).await.unwrap();
    let elder = h.db.create_user("grandpa", AccountRole::Elder, h.clock.now()).await.unwrap();

    let issued = h.ledger.issue_code(Issuer::Family(family)).await.unwrap();
    assert_eq!(issued.code.len(), 6);
    assert!(issued.code.parse::<u32>().is_ok());
    assert_eq!(issued.ttl_seconds, 600);

    h.clock.advance(time::Duration::seconds(601));
    let result = h.ledger.consume_code(&issued.code, Claim::Elder { elder_id: elder }).await;
    assert!(matches!(result, Err(SignalError::Expired)), "{result:?}");

    // burned on the expiry path
    let again = h.ledger.consume_code(&issued.code, Claim::Elder { elder_id: elder }).await;
    assert!(matches!(again, Err(SignalError::NotFound(_))), "{again:?}");
    assert!(h.db.elders_for(family).await.unwrap().is_empty());
}

#[tokio::test]
async fn code_is_still_good_just_before_expiry() {
    let h = Harness::new().await;
    let family = h.db.create_user("son", AccountRole::Family, h.clock.now()).await.unwrap();
    let elder = h.db.create_user("grandma", AccountRole::Elder, h.clock.now()).await.unwrap();

    let issued = h.ledger.issue_code(Issuer::Family(family)).await.unwrap();
    h.clock.advance(time::Duration::seconds(599));

    let rel = h
        .ledger
        .consume_code(&issued.code, Claim::Elder { elder_id: elder })
        .await
        .unwrap();
    assert_eq!(rel, Relationship { elder_id: elder, family_id: family });

    let elders = h.db.elders_for(family).await.unwrap();
    assert_eq!(elders.len(), 1);
    assert_eq!(elders[0].0, elder);
}

#[tokio::test]
async fn concurrent_redemptions_have_one_winner() {
    let h = Harness::new().await;
    let family = h.db.create_user("daughter", AccountRole::Family, h.clock.now()).await.unwrap();
    let mut elders = Vec::new();
    for n in 0..8 {
        let name = format!("elder-{n}");
        elders.push(h.db.create_user(&name, AccountRole::Elder, h.clock.now()).await.unwrap());
    }
    let issued = h.ledger.issue_code(Issuer::Family(family)).await.unwrap();

    let mut tasks = Vec::new();
    for elder_id in elders {
        let ledger = Arc::clone(&h.ledger);
        let code = issued.code.clone();
        tasks.push(tokio::spawn(async move {
            ledger.consume_code(&code, Claim::Elder { elder_id }).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(SignalError::NotFound(_)) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.db.elders_for(family).await.unwrap().len(), 1);
}

#[tokio::test]
async fn elder_initiated_flow_reports_the_claim() {
    let h = Harness::new().await;
    let family = h.db.create_user("grandson", AccountRole::Family, h.clock.now()).await.unwrap();
    let issued = h.ledger.issue_code(Issuer::Elder).await.unwrap();

    assert_eq!(h.ledger.poll_claim(&issued.code).await.unwrap(), ClaimStatus::Waiting);

    let profile = ElderProfile {
        name: "阿嬤".into(),
        gender: Some("female".into()),
        age: Some(88),
    };
    let rel = h
        .ledger
        .consume_code(&issued.code, Claim::Family { family_id: family, elder: profile })
        .await
        .unwrap();
    assert_eq!(rel.family_id, family);

    // still answerable after the code was used, even once it would have expired
    h.clock.advance(time::Duration::seconds(900));
    assert_eq!(
        h.ledger.poll_claim(&issued.code).await.unwrap(),
        ClaimStatus::ClaimedBy { elder_id: rel.elder_id }
    );
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let h = Harness::new().await;
    let elder = h.db.create_user("grandpa", AccountRole::Elder, h.clock.now()).await.unwrap();

    let result = h.ledger.consume_code("000000", Claim::Elder { elder_id: elder }).await;
    assert!(matches!(result, Err(SignalError::NotFound(_))));
}
