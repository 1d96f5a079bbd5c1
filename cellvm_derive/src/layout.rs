//! Derive macro for fixed-size on-disk records.
//!
//! Generates a `Layout` implementation for structs whose fields are
//! fixed-width integers. Fields are read and written in declaration order,
//! each in the byte order passed by the caller, with no padding.
//!
//! # Example
//!
//! ```ignore
//! use cellvm_derive::Layout;
//!
//! #[derive(Layout)]
//! pub struct FuncStub {
//!     pub address: u32,
//!     pub nameofs: u32,
//! }
//! ```
//!
//! # Generated Code
//!
//! ```ignore
//! impl crate::machine::image::Layout for FuncStub {
//!     const SIZE: usize = 0 + <u32 as Field>::SIZE + <u32 as Field>::SIZE;
//!
//!     fn read(bytes: &[u8], order: ByteOrder) -> Option<Self> {
//!         let mut at = 0usize;
//!         Some(Self {
//!             address: Field::read(bytes, &mut at, order)?,
//!             nameofs: Field::read(bytes, &mut at, order)?,
//!         })
//!     }
//!
//!     fn write(&self, out: &mut Vec<u8>, order: ByteOrder) {
//!         Field::write(&self.address, out, order);
//!         Field::write(&self.nameofs, out, order);
//!     }
//! }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

pub fn derive_layout(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return syn::Error::new_spanned(
                    &input,
                    "Layout requires a struct with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(&input, "Layout can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let names: Vec<_> = fields.iter().map(|f| &f.ident).collect();
    let types: Vec<_> = fields.iter().map(|f| &f.ty).collect();

    let expanded = quote! {
        impl #impl_generics crate::machine::image::Layout for #name #ty_generics #where_clause {
            const SIZE: usize = 0 #( + <#types as crate::machine::image::Field>::SIZE )*;

            fn read(
                bytes: &[u8],
                order: crate::machine::image::ByteOrder,
            ) -> ::std::option::Option<Self> {
                let mut at = 0usize;
                ::std::option::Option::Some(Self {
                    #( #names: crate::machine::image::Field::read(bytes, &mut at, order)?, )*
                })
            }

            fn write(&self, out: &mut ::std::vec::Vec<u8>, order: crate::machine::image::ByteOrder) {
                #( crate::machine::image::Field::write(&self.#names, out, order); )*
            }
        }
    };

    TokenStream::from(expanded)
}
