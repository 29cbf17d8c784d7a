//! FFI bindings for Synheart Link
//!
//! This module provides C-compatible functions for driving the frame decoder
//! and reading link state from other languages. All functions use C strings
//! (null-terminated) and return allocated memory that must be freed by the
//! caller using `link_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::slice;

use crate::decoder::{FrameDecoder, DEFAULT_BUFFER_CAP};
use crate::history::history_json;
use crate::interpreter::RecordInterpreter;
use crate::steps::current_steps;
use crate::storage::{keys, FileStore, KeyValueStore};
use crate::types::{BridgeEvent, DeviceIdentity, Record, WEAR_REMINDER_MESSAGE};

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

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe fn open_store(path: *const c_char) -> Option<FileStore> {
    let path = match cstr_to_string(path) {
        Some(p) => p,
        None => {
            set_last_error("Invalid store path pointer");
            return None;
        }
    };
    match FileStore::open(path) {
        Ok(store) => Some(store),
        Err(e) => {
            set_last_error(&e.to_string());
            None
        }
    }
}

// ============================================================================
// Decoder API
// ============================================================================

/// Opaque handle to a frame decoder and record interpreter
pub struct LinkDecoderHandle {
    decoder: FrameDecoder,
    interpreter: RecordInterpreter,
}

/// Create a decoder with the given buffer cap in characters.
///
/// # Safety
/// - Returns a pointer to a newly allocated decoder.
/// - Must be freed with `link_decoder_free`.
#[no_mangle]
pub unsafe extern "C" fn link_decoder_new(buffer_cap: i32) -> *mut LinkDecoderHandle {
    clear_last_error();

    let cap = if buffer_cap <= 0 {
        DEFAULT_BUFFER_CAP
    } else {
        buffer_cap as usize
    };

    let handle = Box::new(LinkDecoderHandle {
        decoder: FrameDecoder::new(cap),
        interpreter: RecordInterpreter::default(),
    });
    Box::into_raw(handle)
}

/// Free a decoder.
///
/// # Safety
/// - `decoder` must be a valid pointer returned by `link_decoder_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn link_decoder_free(decoder: *mut LinkDecoderHandle) {
    if !decoder.is_null() {
        drop(Box::from_raw(decoder));
    }
}

/// Feed a chunk of raw bytes and return the resulting events as a JSON array.
///
/// Samples come back as `health_data_received` events and wear reminders as
/// `notification_received` events, in stream order.
///
/// # Safety
/// - `decoder` must be a valid pointer returned by `link_decoder_new`.
/// - `data` must point to `len` readable bytes, or be NULL with `len` 0.
/// - Returns a newly allocated string that must be freed with `link_free_string`.
/// - Returns NULL on error; call `link_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn link_decoder_feed(
    decoder: *mut LinkDecoderHandle,
    data: *const u8,
    len: usize,
) -> *mut c_char {
    clear_last_error();

    if decoder.is_null() {
        set_last_error("Null decoder pointer");
        return ptr::null_mut();
    }
    if data.is_null() && len > 0 {
        set_last_error("Null data pointer");
        return ptr::null_mut();
    }

    let handle = &mut *decoder;
    let chunk: &[u8] = if len == 0 {
        &[]
    } else {
        slice::from_raw_parts(data, len)
    };

    let events: Vec<BridgeEvent> = handle
        .decoder
        .feed(chunk)
        .iter()
        .filter_map(|frame| handle.interpreter.interpret(frame))
        .map(|record| match record {
            Record::Sample(sample) => BridgeEvent::HealthDataReceived(sample),
            Record::WearReminder => BridgeEvent::NotificationReceived {
                message: WEAR_REMINDER_MESSAGE.to_string(),
            },
        })
        .collect();

    match serde_json::to_string(&events) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Discard any partially buffered frame.
///
/// # Safety
/// - `decoder` must be a valid pointer returned by `link_decoder_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn link_decoder_reset(decoder: *mut LinkDecoderHandle) {
    if !decoder.is_null() {
        (*decoder).decoder.reset();
    }
}

// ============================================================================
// Store API
// ============================================================================

/// Save the paired band's address in the store at `store_path`.
///
/// # Safety
/// - `store_path` and `address` must be valid null-terminated C strings.
/// - Returns 0 on success, non-zero on error.
/// - On error, call `link_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn link_set_device_identity(
    store_path: *const c_char,
    address: *const c_char,
) -> i32 {
    clear_last_error();

    let address = match cstr_to_string(address) {
        Some(a) => a,
        None => {
            set_last_error("Invalid address string pointer");
            return -1;
        }
    };
    let identity = match DeviceIdentity::new(address) {
        Ok(identity) => identity,
        Err(e) => {
            set_last_error(&e.to_string());
            return -1;
        }
    };
    let Some(store) = open_store(store_path) else {
        return -1;
    };

    match store.put(
        keys::LAST_DEVICE_ADDRESS,
        serde_json::Value::from(identity.as_str()),
    ) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Return the persisted sample history as a JSON array, oldest first.
///
/// # Safety
/// - `store_path` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `link_free_string`.
/// - Returns NULL on error; call `link_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn link_query_history(store_path: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(store) = open_store(store_path) else {
        return ptr::null_mut();
    };
    match history_json(&store) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Return the persisted step count.
///
/// # Safety
/// - `store_path` must be a valid null-terminated C string.
/// - Returns -1 on error; call `link_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn link_query_current_steps(store_path: *const c_char) -> i64 {
    clear_last_error();

    let Some(store) = open_store(store_path) else {
        return -1;
    };
    match current_steps(&store) {
        Ok(steps) => steps,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Link functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Link function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn link_free_string(ptr: *mut c_char) {
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
/// - The returned pointer is valid until the next Link function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn link_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the Link library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn link_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
