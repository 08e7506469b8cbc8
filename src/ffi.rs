//! FFI bindings for Topic Watch
//!
//! This module provides C-compatible functions for driving a topic registry
//! from other languages. All functions use C strings (null-terminated) and
//! return allocated memory that must be freed by the caller using
//! `tw_free_string`.
//!
//! Functions returning `i32` use 0 (or a non-negative count) for success and
//! -1 for failure; `tw_last_error` and `tw_last_error_code` describe the
//! failure.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::encoder::MessageEncoder;
use crate::error::TopicError;
use crate::registry::{SubscriptionHandle, TopicRegistry};
use crate::types::Sample;

// Thread-local storage for the last error message and code
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static LAST_ERROR_CODE: Cell<u32> = const { Cell::new(0) };
}

/// Record an error for `tw_last_error` / `tw_last_error_code`
fn set_last_error(err: &TopicError) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(err.to_string()).ok();
    });
    LAST_ERROR_CODE.with(|c| c.set(err.code()));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
    LAST_ERROR_CODE.with(|c| c.set(0));
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Read a required string argument, recording an error when it is missing
unsafe fn required_arg(ptr: *const c_char, name: &str) -> Option<String> {
    let value = cstr_to_string(ptr);
    if value.is_none() {
        set_last_error(&TopicError::Validation(format!(
            "Invalid {name} string pointer"
        )));
    }
    value
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Map a unit result onto the `i32` status convention
fn status(result: Result<(), TopicError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

// ============================================================================
// Registry Lifecycle
// ============================================================================

/// Opaque handle to a TopicRegistry
pub struct TopicRegistryHandle {
    registry: TopicRegistry,
    subscriptions: Mutex<HashMap<Uuid, SubscriptionHandle>>,
    encoder: MessageEncoder,
}

impl TopicRegistryHandle {
    fn subscription(&self, id: &str) -> Result<SubscriptionHandle, TopicError> {
        let id = Uuid::parse_str(id.trim())
            .map_err(|e| TopicError::Validation(format!("Invalid subscription id: {e}")))?;
        self.subscriptions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| TopicError::NotFound(format!("subscription {id}")))
    }
}

/// Create a registry from a JSON configuration, or defaults when NULL.
///
/// # Safety
/// - `config_json` must be NULL or a valid null-terminated C string.
/// - Must be freed with `tw_registry_free`.
/// - Returns NULL on error; call `tw_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn tw_registry_new(config_json: *const c_char) -> *mut TopicRegistryHandle {
    clear_last_error();

    let config = match cstr_to_string(config_json) {
        None => EngineConfig::default(),
        Some(json) => match EngineConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e);
                return ptr::null_mut();
            }
        },
    };

    let handle = Box::new(TopicRegistryHandle {
        registry: TopicRegistry::new(config),
        subscriptions: Mutex::new(HashMap::new()),
        encoder: MessageEncoder::new(),
    });
    Box::into_raw(handle)
}

/// Free a registry, deleting every topic and closing every subscription.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn tw_registry_free(registry: *mut TopicRegistryHandle) {
    if !registry.is_null() {
        drop(Box::from_raw(registry));
    }
}

// ============================================================================
// Topic Management
// ============================================================================

/// Create a topic from a JSON topic spec.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `name` and `spec_json` must be valid null-terminated C strings.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn tw_create_topic(
    registry: *mut TopicRegistryHandle,
    name: *const c_char,
    spec_json: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };
    let Some(name) = required_arg(name, "name") else {
        return -1;
    };
    let Some(spec) = required_arg(spec_json, "spec") else {
        return -1;
    };

    status(handle.registry.create_topic(&name, &spec).map(|_| ()))
}

/// Delete a topic.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `name` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error (13013 when the topic does not exist).
#[no_mangle]
pub unsafe extern "C" fn tw_delete_topic(
    registry: *mut TopicRegistryHandle,
    name: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };
    let Some(name) = required_arg(name, "name") else {
        return -1;
    };

    let result = handle.registry.delete_topic(&name);
    if result.is_ok() {
        handle.subscriptions.lock().retain(|_, sub| sub.topic != name);
    }
    status(result)
}

/// Delete every topic.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - Returns the number of topics removed, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn tw_clean_up(registry: *mut TopicRegistryHandle) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };

    let removed = handle.registry.clean_up();
    handle.subscriptions.lock().clear();
    i32::try_from(removed).unwrap_or(i32::MAX)
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Subscribe to a topic.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `topic` must be a valid null-terminated C string.
/// - Returns the subscription id as a newly allocated string that must be
///   freed with `tw_free_string`, or NULL on error.
#[no_mangle]
pub unsafe extern "C" fn tw_subscribe(
    registry: *mut TopicRegistryHandle,
    topic: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return ptr::null_mut();
    };
    let Some(topic) = required_arg(topic, "topic") else {
        return ptr::null_mut();
    };

    match handle.registry.subscribe(&topic) {
        Ok(subscription) => {
            let id = subscription.id;
            handle.subscriptions.lock().insert(id, subscription);
            string_to_cstr(&id.to_string())
        }
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Cancel a subscription.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `subscription_id` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn tw_unsubscribe(
    registry: *mut TopicRegistryHandle,
    subscription_id: *const c_char,
) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };
    let Some(id) = required_arg(subscription_id, "subscription id") else {
        return -1;
    };

    let result = handle.subscription(&id).and_then(|subscription| {
        handle.registry.unsubscribe(&subscription)?;
        handle.subscriptions.lock().remove(&subscription.id);
        Ok(())
    });
    status(result)
}

/// Wait for the next message of a subscription.
///
/// A negative `timeout_ms` blocks until a message arrives or the topic is
/// deleted.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `subscription_id` must be a valid null-terminated C string.
/// - Returns a `{"time", "datas"}` JSON string that must be freed with
///   `tw_free_string`, or NULL on error or timeout (error code 13014).
#[no_mangle]
pub unsafe extern "C" fn tw_get_next_message(
    registry: *mut TopicRegistryHandle,
    subscription_id: *const c_char,
    timeout_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return ptr::null_mut();
    };
    let Some(id) = required_arg(subscription_id, "subscription id") else {
        return ptr::null_mut();
    };

    let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
    let result = handle.subscription(&id).and_then(|subscription| {
        let event = handle.registry.get_next_message(&subscription, timeout)?;
        handle.encoder.encode_to_json(&event)
    });

    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Ingest
// ============================================================================

/// Ingest one numeric sample.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `device` and `endpoint` must be valid null-terminated C strings.
/// - Returns the number of topics that accepted the sample, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn tw_ingest(
    registry: *mut TopicRegistryHandle,
    device: *const c_char,
    endpoint: *const c_char,
    timestamp_ms: i64,
    value: f64,
) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };
    let Some(device) = required_arg(device, "device") else {
        return -1;
    };
    let Some(endpoint) = required_arg(endpoint, "endpoint") else {
        return -1;
    };

    match handle
        .registry
        .ingest(&device, &endpoint, Sample::new(timestamp_ms, value))
    {
        Ok(report) => i32::try_from(report.accepted).unwrap_or(i32::MAX),
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Advance the watermark for one endpoint, or for every topic when both
/// `device` and `endpoint` are NULL.
///
/// # Safety
/// - `registry` must be a valid pointer returned by `tw_registry_new`.
/// - `device` and `endpoint` must be NULL or valid null-terminated C strings.
/// - Returns the number of events published, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn tw_advance_watermark(
    registry: *mut TopicRegistryHandle,
    device: *const c_char,
    endpoint: *const c_char,
    watermark_ms: i64,
) -> i32 {
    clear_last_error();

    let Some(handle) = registry.as_ref() else {
        set_last_error(&TopicError::Validation("Null registry pointer".into()));
        return -1;
    };

    let result = match (cstr_to_string(device), cstr_to_string(endpoint)) {
        (Some(device), Some(endpoint)) => {
            handle
                .registry
                .advance_watermark(&device, &endpoint, watermark_ms)
        }
        (None, None) => Ok(handle.registry.advance_all(watermark_ms)),
        _ => Err(TopicError::Validation(
            "device and endpoint must both be set or both be NULL".to_string(),
        )),
    };

    match result {
        Ok(events) => i32::try_from(events.len()).unwrap_or(i32::MAX),
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Topic Watch functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Topic Watch function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn tw_free_string(ptr: *mut c_char) {
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
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Topic Watch call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn tw_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the numeric code of the last error (0 when none).
///
/// # Safety
/// - Always safe to call; marked unsafe for ABI symmetry.
#[no_mangle]
pub unsafe extern "C" fn tw_last_error_code() -> u32 {
    LAST_ERROR_CODE.with(|c| c.get())
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the Topic Watch library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn tw_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn comfort_spec() -> CString {
        CString::new(
            r#"{
                "deviceName": "device1",
                "endpointName": "temp",
                "rules": [{
                    "computingRules": {
                        "state": 1, "lowerBound": 13.64, "upperBound": 23,
                        "excludeRule": 0, "windowSize": "3,000ms", "Aggregation": "AVG"
                    },
                    "pubRules": { "repeatPub": "200,000ms" }
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_ffi_topic_lifecycle() {
        let name = CString::new("comfort").unwrap();
        let device = CString::new("device1").unwrap();
        let endpoint = CString::new("temp").unwrap();
        let spec = comfort_spec();

        unsafe {
            let registry = tw_registry_new(ptr::null());
            assert!(!registry.is_null());

            assert_eq!(tw_create_topic(registry, name.as_ptr(), spec.as_ptr()), 0);
            let sub = tw_subscribe(registry, name.as_ptr());
            assert!(!sub.is_null());

            for (t, v) in [(0, 15.0), (1000, 18.0), (2000, 20.0)] {
                assert_eq!(tw_ingest(registry, device.as_ptr(), endpoint.as_ptr(), t, v), 1);
            }
            assert_eq!(
                tw_advance_watermark(registry, device.as_ptr(), endpoint.as_ptr(), 3000),
                1
            );

            let message = tw_get_next_message(registry, sub, 100);
            assert!(!message.is_null());
            let parsed: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(message).to_str().unwrap()).unwrap();
            assert_eq!(parsed["time"], 3000);
            assert_eq!(parsed["datas"][0]["point"], "temp");
            tw_free_string(message);

            assert!(tw_get_next_message(registry, sub, 10).is_null());
            assert_eq!(tw_last_error_code(), 13014);

            assert_eq!(tw_unsubscribe(registry, sub), 0);
            tw_free_string(sub);

            assert_eq!(tw_delete_topic(registry, name.as_ptr()), 0);
            assert_eq!(tw_delete_topic(registry, name.as_ptr()), -1);
            assert_eq!(tw_last_error_code(), 13013);

            tw_registry_free(registry);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        let name = CString::new("bad").unwrap();
        let spec = CString::new("not json").unwrap();

        unsafe {
            let registry = tw_registry_new(ptr::null());
            assert_eq!(tw_create_topic(registry, name.as_ptr(), spec.as_ptr()), -1);

            let error = tw_last_error();
            assert!(!error.is_null());
            assert!(!CStr::from_ptr(error).to_str().unwrap().is_empty());
            assert_eq!(tw_last_error_code(), 13061);

            assert_eq!(tw_create_topic(ptr::null_mut(), name.as_ptr(), spec.as_ptr()), -1);
            assert_eq!(tw_clean_up(registry), 0);
            tw_registry_free(registry);
        }
    }

    #[test]
    fn test_ffi_invalid_config() {
        let config = CString::new(r#"{"maxTopics": 0}"#).unwrap();
        unsafe {
            assert!(tw_registry_new(config.as_ptr()).is_null());
            assert_eq!(tw_last_error_code(), 13061);
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = tw_version();
            assert!(!version.is_null());
            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
