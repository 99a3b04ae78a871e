//! FFI bindings for Posture Flux
//!
//! This module provides C-compatible functions for calling Posture Flux from
//! other languages. All functions use C strings (null-terminated) and return
//! allocated memory that must be freed by the caller using
//! `posture_free_string`.

use serde::Serialize;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::aggregate::Aggregator;
use crate::config::PostureConfig;
use crate::decision::PostureProfile;
use crate::error::PostureError;
use crate::pipeline::{classify_samples, PostureSession};
use crate::schema::SampleAdapter;
use crate::store::InMemoryStore;

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Serialize a result to a newly allocated C string, or record the error
fn json_or_error<T: Serialize>(result: Result<T, PostureError>) -> *mut c_char {
    let json = result.and_then(|value| Ok(serde_json::to_string(&value)?));
    match json {
        Ok(json) => match CString::new(json) {
            Ok(cstr) => cstr.into_raw(),
            Err(_) => {
                set_last_error("Output contained an interior NUL byte");
                ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Optional JSON argument: NULL selects the default
unsafe fn optional_config(ptr: *const c_char) -> Result<PostureConfig, PostureError> {
    match cstr_to_string(ptr) {
        Some(json) => PostureConfig::from_json(&json),
        None => Ok(PostureConfig::default()),
    }
}

unsafe fn optional_profile(ptr: *const c_char) -> Result<PostureProfile, PostureError> {
    match cstr_to_string(ptr) {
        Some(json) => PostureProfile::from_json(&json),
        None => Ok(PostureProfile::default()),
    }
}

// ============================================================================
// Stateless API
// ============================================================================

/// Classify a JSON array of samples and return a JSON array of classifications.
///
/// # Safety
/// - `samples_json` must be a valid null-terminated C string.
/// - `profile_json` and `config_json` may be NULL to use the defaults.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_classify_json(
    samples_json: *const c_char,
    profile_json: *const c_char,
    config_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(samples) = cstr_to_string(samples_json) else {
        set_last_error("Invalid samples string pointer");
        return ptr::null_mut();
    };

    json_or_error(
        optional_profile(profile_json).and_then(|profile| {
            let config = optional_config(config_json)?;
            classify_samples(&samples, &profile, &config)
        }),
    )
}

/// Bucket a JSON array of samples into time-of-day blocks for `date` (YYYY-MM-DD).
///
/// # Safety
/// - `samples_json` and `date` must be valid null-terminated C strings.
/// - `config_json` may be NULL to use the defaults.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_aggregate_json(
    samples_json: *const c_char,
    date: *const c_char,
    config_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let (Some(samples), Some(date)) = (cstr_to_string(samples_json), cstr_to_string(date)) else {
        set_last_error("Invalid samples or date string pointer");
        return ptr::null_mut();
    };

    json_or_error((|| -> Result<_, PostureError> {
        let config = optional_config(config_json)?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| PostureError::InvalidDate(date.clone()))?;
        let samples = SampleAdapter::parse_array(&samples)?;
        let aggregator = Aggregator::new(config.angle, config.features, config.utc_offset());
        Ok(aggregator.aggregated_view(&samples, date))
    })())
}

// ============================================================================
// Stateful Session API
// ============================================================================

/// Opaque handle to a PostureSession backed by an in-process store
pub struct PostureSessionHandle {
    session: PostureSession,
}

/// Open a session for `user_id`.
///
/// # Safety
/// - `user_id` must be a valid null-terminated C string.
/// - `config_json` may be NULL to use the defaults.
/// - Must be freed with `posture_session_free`.
/// - Returns NULL on error.
#[no_mangle]
pub unsafe extern "C" fn posture_session_new(
    user_id: *const c_char,
    config_json: *const c_char,
) -> *mut PostureSessionHandle {
    clear_last_error();

    let Some(user_id) = cstr_to_string(user_id) else {
        set_last_error("Invalid user id string pointer");
        return ptr::null_mut();
    };

    let opened = optional_config(config_json)
        .and_then(|config| PostureSession::open(user_id, Arc::new(InMemoryStore::new()), config));
    match opened {
        Ok(session) => Box::into_raw(Box::new(PostureSessionHandle { session })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Tear down and free a session.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `posture_session_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn posture_session_free(handle: *mut PostureSessionHandle) {
    if !handle.is_null() {
        let mut handle = Box::from_raw(handle);
        if let Err(e) = handle.session.teardown() {
            set_last_error(&e.to_string());
        }
    }
}

/// Ingest a JSON array of samples and return a JSON array of ingest reports.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `posture_session_new`.
/// - `samples_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_session_ingest_json(
    handle: *mut PostureSessionHandle,
    samples_json: *const c_char,
    now_ms: u64,
) -> *mut c_char {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &mut *handle;

    let Some(samples) = cstr_to_string(samples_json) else {
        set_last_error("Invalid samples string pointer");
        return ptr::null_mut();
    };

    json_or_error(SampleAdapter::parse_array(&samples).map(|samples| {
        samples
            .into_iter()
            .map(|sample| handle.session.ingest(sample, now_ms))
            .collect::<Vec<_>>()
    }))
}

/// Fire due timers and return the resulting events as a JSON array.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `posture_session_new`.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
#[no_mangle]
pub unsafe extern "C" fn posture_session_tick(
    handle: *mut PostureSessionHandle,
    now_ms: u64,
) -> *mut c_char {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &mut *handle;
    json_or_error(Ok(handle.session.tick(now_ms)))
}

/// Total points of the session, or -1 for a NULL handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `posture_session_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn posture_session_points(handle: *const PostureSessionHandle) -> i64 {
    if handle.is_null() {
        return -1;
    }
    let handle = &*handle;
    i64::try_from(handle.session.score().points).unwrap_or(i64::MAX)
}

/// Free a string returned by Posture Flux functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Posture Flux function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn posture_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - The returned pointer is valid until the next Posture Flux call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn posture_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn posture_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
