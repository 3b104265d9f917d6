use crate::{
    BucketGateError,
    redis::{RedisKey, RedisKeyGenerator},
};

#[test]
fn accepts_plain_keys() {
    let key = RedisKey::try_from("origin_a").unwrap();
    assert_eq!(&**key, "origin_a");

    let key = RedisKey::try_from("x".repeat(255)).unwrap();
    assert_eq!(key.len(), 255);
}

#[test]
fn rejects_invalid_keys() {
    for bad in [
        String::new(),
        "x".repeat(256),
        "tenant:origin".to_string(),
        "{origin}".to_string(),
        "origin}".to_string(),
    ] {
        let err = RedisKey::try_from(bad.as_str()).unwrap_err();
        assert!(
            matches!(err, BucketGateError::InvalidRedisKey(_)),
            "{bad:?} gave {err:?}"
        );
    }
}

#[test]
fn default_prefix_is_crate_name() {
    assert_eq!(&**RedisKey::default_prefix(), "bucketgate");
}

#[test]
fn generated_keys_share_one_hash_tag() {
    let generator = RedisKeyGenerator::new(RedisKey::try_from("p").unwrap());
    let keys = generator.get(&RedisKey::try_from("k").unwrap());

    assert_eq!(keys.tokens, "p:{k}:tokens");
    assert_eq!(keys.timestamp, "p:{k}:timestamp");
    assert_eq!(keys.config, "p:{k}:config");
}

#[test]
fn generator_keeps_no_state_per_key() {
    let generator = RedisKeyGenerator::new(RedisKey::default_prefix());
    let before = format!("{generator:?}");

    for i in 0..100_000 {
        let keys = generator.get(&RedisKey::try_from(format!("origin_{i}")).unwrap());
        assert_eq!(keys.tokens, format!("bucketgate:{{origin_{i}}}:tokens"));
    }

    // same debug output: nothing accumulated for the keys above
    assert_eq!(format!("{generator:?}"), before);

    let key = RedisKey::try_from("k").unwrap();
    assert_eq!(generator.get(&key), generator.get(&key));
}
