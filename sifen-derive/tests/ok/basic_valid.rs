use sifen_derive::Validate;

#[derive(Validate)]
pub struct Establishment {
    #[validate(max_digits = 3)]
    pub establishment: String,
    #[validate(max_digits = 3)]
    pub issuance_point: String,
    pub description: String,
}

fn main() {
    let ok = Establishment::new("001".into(), "2".into(), "Casa Matriz".into());
    assert!(ok.is_ok());

    let bad = Establishment::new("0A1".into(), "001".into(), "Casa Matriz".into());
    assert!(bad.err().unwrap().contains("establishment"));
}
