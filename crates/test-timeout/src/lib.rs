//! Watchdog attributes for tests that talk to sockets and timers.
//!
//! `#[timeout(N)]` wraps a synchronous test, `#[tokio_timeout_test(N)]` wraps an
//! async one in a fresh current-thread runtime. `N` is seconds, or carries an
//! explicit unit: `#[tokio_timeout_test(500ms)]`, `#[timeout(3s)]`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_ms = match parse_timeout(attr) {
        Ok(ms) => ms,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let watched = watchdog(timeout_ms, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_ms = match parse_timeout(attr) {
        Ok(ms) => ms,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &["test"]);
    let watched = watchdog(timeout_ms, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watched
        }
    })
}

/// Accepts an empty attribute, a bare integer (seconds) or an integer with an
/// `s` or `ms` suffix.
fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_MS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let value: u64 = lit.base10_parse()?;
    let ms = match lit.suffix() {
        "" | "s" => value.checked_mul(1_000),
        "ms" => Some(value),
        other => {
            return Err(syn::Error::new_spanned(
                &lit,
                format!("unsupported timeout unit `{other}`, expected `s` or `ms`"),
            ))
        }
    };
    match ms {
        Some(0) => Err(syn::Error::new_spanned(&lit, "timeout must be greater than zero")),
        Some(ms) => Ok(ms),
        None => Err(syn::Error::new_spanned(&lit, "timeout is too large")),
    }
}

/// Drops the attribute whose path is exactly `path`, so the generated
/// `#[test]` is the only test marker left.
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments = &attr.path().segments;
            segments.len() != path.len()
                || !segments.iter().zip(path).all(|(seg, name)| seg.ident == name)
        })
        .collect()
}

/// Runs `body` on its own thread and fails the test if it has not finished
/// within `timeout_ms`. Panics inside the body are re-raised on the test thread.
fn watchdog(timeout_ms: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_millis(#timeout_ms);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}
