use super::*;

#[test]
fn from_raw_normalizes() {
    let embedding = Embedding::from_raw(vec![3.0, 4.0]).expect("valid vector");
    assert_eq!(embedding.dimension(), 2);
    assert!((embedding.as_slice()[0] - 0.6).abs() < 1e-6);
    assert!((embedding.as_slice()[1] - 0.8).abs() < 1e-6);
}

#[test]
fn from_raw_rejects_degenerate_vectors() {
    assert!(Embedding::from_raw(Vec::new()).is_err());
    assert!(Embedding::from_raw(vec![0.0, 0.0, 0.0]).is_err());
    assert!(Embedding::from_raw(vec![1.0, f32::NAN]).is_err());
    assert!(Embedding::from_raw(vec![f32::INFINITY, 1.0]).is_err());
}

#[test]
fn cosine_similarity_of_known_vectors() {
    assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);

    let a = Embedding::from_raw(vec![1.0, 1.0]).expect("valid vector");
    let b = Embedding::from_raw(vec![1.0, 0.0]).expect("valid vector");
    assert!((a.cosine_similarity(&b) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
}

#[test]
fn empty_text_is_an_input_error() {
    assert!(matches!(
        ensure_embeddable("   \n"),
        Err(RagError::InvalidInput(_))
    ));
    assert!(ensure_embeddable("hello").is_ok());
}
