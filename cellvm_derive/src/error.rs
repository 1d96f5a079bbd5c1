//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations
//! from a `#[error("...")]` message on every variant (or on the struct).
//!
//! # Usage
//!
//! ```ignore
//! use cellvm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum AsmError {
//!     #[error("unknown instruction: {0}")]
//!     UnknownInstruction(String),
//!
//!     #[error("line {line}: {message}")]
//!     Located { line: usize, message: String },
//!
//!     #[error("empty source")]
//!     Empty,
//! }
//! ```
//!
//! Tuple fields are referenced positionally (`{0}`, `{1}`), named fields by
//! name. Format specs such as `{0:#x}` or `{code:?}` are kept as written.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let message = message(&variant.attrs, &variant.ident, "variant")?;
                    let ident = &variant.ident;
                    Ok(match &variant.fields {
                        Fields::Unit => quote! { Self::#ident => write!(f, #message), },
                        Fields::Unnamed(fields) => {
                            let count = fields.unnamed.len();
                            let message = rename_positional(&message, count);
                            let binds = positional_idents(count);
                            let pattern = binds.iter().map(|b| {
                                if mentions(&message, b) { quote! { #b } } else { quote! { _ } }
                            });
                            let used: Vec<_> = binds.iter().filter(|b| mentions(&message, b)).collect();
                            quote! {
                                Self::#ident(#(#pattern),*) => write!(f, #message #(, #used = #used)*),
                            }
                        }
                        Fields::Named(fields) => {
                            let used: Vec<_> = fields
                                .named
                                .iter()
                                .filter_map(|f| f.ident.as_ref())
                                .filter(|ident| mentions(&message, ident))
                                .collect();
                            quote! {
                                Self::#ident { #(#used,)* .. } => write!(f, #message #(, #used = #used)*),
                            }
                        }
                    })
                })
                .collect::<syn::Result<Vec<_>>>()?;

            if arms.is_empty() {
                quote! { match *self {} }
            } else {
                quote! { match self { #(#arms)* } }
            }
        }
        Data::Struct(data) => {
            let message = message(&input.attrs, &input.ident, "type")?;
            match &data.fields {
                Fields::Unit => quote! { write!(f, #message) },
                Fields::Named(fields) => {
                    let used: Vec<_> = fields
                        .named
                        .iter()
                        .filter_map(|f| f.ident.as_ref())
                        .filter(|ident| mentions(&message, ident))
                        .collect();
                    quote! { write!(f, #message #(, #used = self.#used)*) }
                }
                Fields::Unnamed(fields) => {
                    let count = fields.unnamed.len();
                    let message = rename_positional(&message, count);
                    let (binds, index): (Vec<_>, Vec<_>) = positional_idents(count)
                        .into_iter()
                        .zip((0..count).map(syn::Index::from))
                        .filter(|(b, _)| mentions(&message, b))
                        .unzip();
                    quote! { write!(f, #message #(, #binds = self.#index)*) }
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Reads the message literal out of `#[error("...")]`.
fn message<T: ToTokens>(attrs: &[Attribute], target: &T, kind: &str) -> syn::Result<String> {
    let Some(attr) = attrs.iter().find(|a| a.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            format!(
                "missing #[error(\"...\")] on {kind} `{}`; every error needs a display message",
                target.to_token_stream()
            ),
        ));
    };

    attr.parse_args::<LitStr>()
        .map(|lit| lit.value())
        .map_err(|_| {
            syn::Error::new_spanned(
                &attr.meta,
                "expected a string literal, e.g. #[error(\"invalid opcode {0}\")]",
            )
        })
}

/// Whether the message interpolates `ident`, with or without a format spec.
fn mentions(message: &str, ident: &syn::Ident) -> bool {
    let ident = ident.to_string();
    message.contains(&format!("{{{ident}}}")) || message.contains(&format!("{{{ident}:"))
}

fn positional_idents(count: usize) -> Vec<syn::Ident> {
    (0..count).map(|i| format_ident!("_{}", i)).collect()
}

/// Rewrites `{0}` / `{0:x}` into `{_0}` / `{_0:x}` so tuple fields can be
/// passed to `write!` as named arguments.
fn rename_positional(message: &str, count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..count).rev() {
        out = out
            .replace(&format!("{{{i}}}"), &format!("{{_{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{_{i}:"));
    }
    out
}
