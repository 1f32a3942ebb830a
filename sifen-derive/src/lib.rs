use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitInt, Type, parse_macro_input};

mod rules;

/// A single `#[validate(...)]` entry, e.g. `skip` or `max_digits = 8`.
pub(crate) struct Rule {
    name: Ident,
    arg: Option<LitInt>,
}

fn extract_error_type(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate_error")) {
        let mut ty = None;
        attr.parse_nested_meta(|meta| {
            ty = Some(meta.path.to_token_stream());
            Ok(())
        })?;
        if let Some(t) = ty {
            return Ok(t);
        }
    }
    Ok(quote! { String })
}

fn extract_rules(attrs: &[Attribute]) -> syn::Result<Vec<Rule>> {
    let mut out = vec![];
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| {
            let name = meta
                .path
                .get_ident()
                .cloned()
                .ok_or_else(|| meta.error("expected a rule name"))?;
            let arg = if meta.input.peek(syn::Token![=]) {
                Some(meta.value()?.parse::<LitInt>()?)
            } else {
                None
            };
            out.push(Rule { name, arg });
            Ok(())
        })?;
    }
    Ok(out)
}

/// Only allow rules on String for now.
fn is_string_type(ty: &Type) -> bool {
    match ty {
        Type::Path(p) => p.path.segments.last().map(|s| s.ident == "String").unwrap_or(false),
        Type::Reference(r) => {
            if let Type::Path(p) = &*r.elem {
                p.path.segments.last().map(|s| s.ident == "String").unwrap_or(false)
            } else {
                false
            }
        }
        _ => false,
    }
}

#[proc_macro_derive(Validate, attributes(validate, validate_error))]
pub fn derive_validate(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    match expand(ast) {
        Ok(ts) => ts.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(ast: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = ast.ident;
    let error_type = extract_error_type(&ast.attrs)?;
    let struct_rules = extract_rules(&ast.attrs)?;

    let mut ctor_params = vec![];
    let mut ctor_assigns = vec![];
    let mut validations = vec![];

    let fields = match ast.data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Validate supports named structs only",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "Validate can only be used on structs",
            ));
        }
    };

    for field in fields {
        let Some(ident) = field.ident else {
            continue;
        };
        let ty = field.ty;

        ctor_params.push(quote! { #ident: #ty });
        ctor_assigns.push(quote! { #ident });

        let field_rules = extract_rules(&field.attrs)?;
        if field_rules.iter().any(|r| r.name == "skip") {
            continue;
        }
        let rules: Vec<&Rule> = if field_rules.is_empty() {
            struct_rules.iter().collect()
        } else {
            field_rules.iter().collect()
        };
        if rules.is_empty() {
            continue;
        }

        if !is_string_type(&ty) {
            return Err(syn::Error::new_spanned(
                &ident,
                format!("Validation rules can only be applied to String fields: {ident}"),
            ));
        }

        for rule in rules {
            validations.push(rules::dispatch(rule, &ident)?);
        }
    }

    Ok(quote! {
        impl #struct_name {
            #[allow(clippy::too_many_arguments)]
            pub fn new(
                #(#ctor_params),*
            ) -> ::core::result::Result<Self, #error_type> {

                type E = #error_type;

                #(
                    #validations
                )*

                Ok(Self {
                    #(#ctor_assigns),*
                })
            }
        }
    })
}
