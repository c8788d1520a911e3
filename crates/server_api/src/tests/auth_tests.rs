use super::*;

const SECRET: &str = "test-secret";

#[test]
fn minted_token_decodes_with_access_type() {
    let token = mint_access_token(SECRET, UserId(7), "alice", Duration::minutes(5)).expect("mint");
    let claims = decode_access_token(SECRET, &token).expect("decode");
    assert_eq!(claims.uid, 7);
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.typ, ACCESS_TOKEN_TYPE);
}

#[test]
fn refresh_tokens_are_rejected() {
    let now = Utc::now();
    let claims = AccessClaims {
        sub: "alice".into(),
        uid: 7,
        typ: "refresh".into(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(5)).timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("encode");
    assert!(matches!(
        decode_access_token(SECRET, &token),
        Err(AuthError::WrongTokenType)
    ));
}

#[test]
fn expired_and_foreign_tokens_are_invalid() {
    let expired =
        mint_access_token(SECRET, UserId(7), "alice", Duration::minutes(-10)).expect("mint");
    assert!(matches!(
        decode_access_token(SECRET, &expired),
        Err(AuthError::InvalidToken(_))
    ));

    let foreign = mint_access_token("other", UserId(7), "alice", Duration::minutes(5))
        .expect("mint");
    assert!(matches!(
        decode_access_token(SECRET, &foreign),
        Err(AuthError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn authenticate_checks_identity_and_activity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("user");
    let token = mint_access_token(SECRET, alice, "alice", Duration::minutes(5)).expect("mint");

    let user = authenticate(&storage, SECRET, &token, Some(alice))
        .await
        .expect("authenticated");
    assert_eq!(user.username, "alice");

    assert!(matches!(
        authenticate(&storage, SECRET, &token, Some(UserId(alice.0 + 1))).await,
        Err(AuthError::IdentityMismatch(_))
    ));

    storage.set_user_active(alice, false).await.expect("deactivate");
    assert!(matches!(
        authenticate(&storage, SECRET, &token, None).await,
        Err(AuthError::InactiveUser(_))
    ));
    assert!(matches!(
        authenticate(&storage, SECRET, "", None).await,
        Err(AuthError::MissingCredential)
    ));
}
