use sifen_derive::Validate;

#[derive(Debug)]
pub struct WidthError(String);

impl From<String> for WidthError {
    fn from(message: String) -> Self {
        WidthError(message)
    }
}

#[derive(Validate)]
#[validate_error(WidthError)]
pub struct Point {
    #[validate(max_digits = 3)]
    pub establishment: String,
    #[validate(max_digits = 7)]
    pub number: String,
}

fn main() {
    assert!(Point::new("1".into(), "0000001".into()).is_ok());
    assert!(Point::new("0001".into(), "1".into()).is_err());
    assert!(Point::new("".into(), "1".into()).is_err());

    let err = Point::new("001".into(), "12x".into()).err().unwrap();
    assert!(err.0.contains("number"));
}
