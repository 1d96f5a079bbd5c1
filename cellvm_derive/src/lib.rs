//! Derive macros for the cellvm crate.
//!
//! Provides:
//! - `#[derive(Error)]` - `Display` and `std::error::Error` from `#[error("...")]` messages
//! - `#[derive(Layout)]` - fixed-size, byte-order aware record codecs for image tables

mod error;
mod layout;

use proc_macro::TokenStream;

/// Implements `Display` and `Error` for error enums and structs.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}

/// Implements `crate::machine::image::Layout` for a record of fixed-width integers.
#[proc_macro_derive(Layout)]
pub fn derive_layout(input: TokenStream) -> TokenStream {
    layout::derive_layout(input)
}
