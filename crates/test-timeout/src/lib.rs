//! Test attributes that fail a test when it runs past a wall-clock limit.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, while
//! `#[test_timeout::tokio_timeout_test]` wraps an async test in a fresh
//! current-thread runtime. Both accept an optional limit in seconds
//! (`#[test_timeout::timeout(5)]`) and default to 60.
//!
//! The body runs on a helper thread so a deadlocked test still reports a
//! failure instead of hanging the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    let secs = match parse_limit(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    if item.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = item;
    let attrs = strip_attrs(attrs, &["test"]);
    let body = quote! { #block };

    wrap(attrs, vis, sig, secs, body).into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    let secs = match parse_limit(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    if item.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &item.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;
    sig.asyncness = None;
    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let body = quote! {
        {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#secs),
                    async move #block,
                )
                .await
                .expect("test timed out")
            })
        }
    };

    wrap(attrs, vis, sig, secs, body).into()
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// Drops `#[test]` / `#[tokio::test]` so the generated `#[test]` is the only one.
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}

fn wrap(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(limit) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}
