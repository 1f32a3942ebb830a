use sifen_derive::Validate;

#[derive(Validate)]
#[validate(max_digits = 8)]
pub struct Timbrado {
    pub authorization: String,
    pub issue_date: String,
    #[validate(max_digits = 1)]
    pub emission_type: String,
}

fn main() {
    assert!(Timbrado::new("12345678".into(), "20260114".into(), "1".into()).is_ok());
    assert!(Timbrado::new("123456789".into(), "20260114".into(), "1".into()).is_err());
    assert!(Timbrado::new("12345678".into(), "2026-01-14".into(), "1".into()).is_err());
    assert!(Timbrado::new("12345678".into(), "20260114".into(), "12".into()).is_err());
}
