//! Builtin validation rules.
//!
//! Every rule expands to a guard that returns `Err(E::from(String))`, so the
//! configured error type only needs a `From<String>` impl.

use proc_macro2::TokenStream;
use quote::quote;
use syn::Ident;

use crate::Rule;

pub(crate) fn dispatch(rule: &Rule, value: &Ident) -> syn::Result<TokenStream> {
    match rule.name.to_string().as_str() {
        "max_digits" => {
            let width = required_width(rule)?;
            Ok(max_digits(value, width))
        }
        other => Err(syn::Error::new_spanned(
            &rule.name,
            format!("Unknown rule `{other}`"),
        )),
    }
}

fn required_width(rule: &Rule) -> syn::Result<usize> {
    let arg = rule.arg.as_ref().ok_or_else(|| {
        syn::Error::new_spanned(&rule.name, format!("rule `{}` needs `= <width>`", rule.name))
    })?;
    let width = arg.base10_parse::<usize>()?;
    if width == 0 {
        return Err(syn::Error::new_spanned(arg, "width must be positive"));
    }
    Ok(width)
}

/// Digits only, at least one, at most `width`. Shorter values are left for the
/// caller to zero-pad; longer values are never truncated.
fn max_digits(value: &Ident, width: usize) -> TokenStream {
    quote! {
        if #value.is_empty()
            || #value.len() > #width
            || !#value.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(E::from(format!(
                "{} must be 1 to {} digits, got '{}'",
                stringify!(#value),
                #width,
                #value
            )));
        }
    }
}
