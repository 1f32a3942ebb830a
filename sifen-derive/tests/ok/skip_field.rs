use sifen_derive::Validate;

#[derive(Validate)]
#[validate(max_digits = 8)]
pub struct Issuer {
    pub ruc: String,
    #[validate(max_digits = 1)]
    pub ruc_check_digit: String,

    #[validate(skip)]
    pub taxpayer_type: u8,
    #[validate(skip)]
    pub legal_name: String,
}

fn main() {
    let issuer = Issuer::new("4554737".into(), "8".into(), 1, "Empresa S.A.".into());
    assert!(issuer.is_ok());

    let bad_ruc = Issuer::new("4554737-8".into(), "8".into(), 1, String::new());
    assert!(bad_ruc.err().unwrap().contains("ruc"));
}
