//! Product file parsing

use std::io::Write;

use product_video_publisher::clients::source::{parse_products, JsonProductSource};
use product_video_publisher::clients::ProductSource;

#[test]
fn test_metadata_columns_pass_through() {
    let products = parse_products(
        r##"[{
            "fingerprint": "SKU-1",
            "metadata": {
                "title": "Desk Lamp",
                "description": "Warm light",
                "hashtags": ["lamp", "#home"],
                "extra": {"price": 19.99, "sku_group": "lighting"}
            }
        }]"##,
    )
    .unwrap();

    let metadata = &products[0].metadata;
    assert_eq!(metadata.title, "Desk Lamp");
    assert_eq!(metadata.extra["sku_group"], "lighting");
    assert_eq!(metadata.caption(None), "Desk Lamp\n\nWarm light\n\n#lamp #home");
}

#[test]
fn test_blank_existing_media_is_absent() {
    let products = parse_products(
        "{\"fingerprint\": \"A\", \"existing_media_url\": \"  \"}\n{\"fingerprint\": \"B\", \"existing_media_url\": \"https://cdn.example/b.mp4\"}",
    )
    .unwrap();

    assert_eq!(products.len(), 2);
    assert!(products[0].existing_media().is_none());
    assert_eq!(
        products[1].existing_media().map(|u| u.to_string()),
        Some("https://cdn.example/b.mp4".to_string())
    );
}

#[test]
fn test_invalid_fingerprint_rejected() {
    let err = parse_products(r#"[{"fingerprint": ""}]"#).unwrap_err();
    assert!(err.message.contains("invalid products array"), "{}", err.message);
}

#[tokio::test]
async fn test_reads_array_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"fingerprint": "X"}}, {{"fingerprint": "Y", "metadata": {{"title": "Mug"}}}}]"#
    )
    .unwrap();

    let products = JsonProductSource::new(file.path()).products().await.unwrap();
    let fingerprints: Vec<_> = products.iter().map(|p| p.fingerprint.as_str()).collect();
    assert_eq!(fingerprints, vec!["X", "Y"]);
}

#[tokio::test]
async fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = JsonProductSource::new(dir.path().join("none.json"));
    assert!(source.products().await.is_err());
}
