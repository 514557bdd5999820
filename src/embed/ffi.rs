//! C ABI over the embedding API.
//!
//! Handles cross the boundary as plain `u64`, with `0` meaning failure.
//! Byte strings are passed as pointer and length pairs; a null pointer is
//! accepted only together with a zero length. Values returned by
//! [`pocketkv_store_get`] are owned by the caller and must be released with
//! [`pocketkv_buffer_free`].
//!
//! No function here panics on bad input. Misuse is reported through the
//! return value.

use super::Handle;
use std::ptr;

/// Borrows a caller-provided byte string.
///
/// # Safety
///
/// A non-null `ptr` must be valid for reads of `len` bytes for `'a`.
unsafe fn bytes_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if ptr.is_null() {
        let empty: &'a [u8] = &[];
        return (len == 0).then_some(empty);
    }
    Some(std::slice::from_raw_parts(ptr, len))
}

#[no_mangle]
pub extern "C" fn pocketkv_store_new() -> u64 {
    super::store_new().as_raw()
}

#[no_mangle]
pub extern "C" fn pocketkv_store_free(store: u64) -> bool {
    super::store_free(Handle::from_raw(store))
}

/// Copies the value of `key` into a new buffer and writes its length to
/// `out_len`. Returns null if the key is absent, the store is unknown or an
/// argument is invalid.
///
/// # Safety
///
/// `key` must be valid for `key_len` bytes and `out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn pocketkv_store_get(
    store: u64,
    key: *const u8,
    key_len: usize,
    out_len: *mut usize,
) -> *mut u8 {
    if out_len.is_null() {
        return ptr::null_mut();
    }
    *out_len = 0;

    let Some(key) = bytes_arg(key, key_len) else {
        return ptr::null_mut();
    };
    let Some(value) = super::store_get(Handle::from_raw(store), key) else {
        return ptr::null_mut();
    };

    let buffer: Box<[u8]> = value.to_vec().into_boxed_slice();
    *out_len = buffer.len();
    Box::into_raw(buffer) as *mut u8
}

/// Releases a buffer returned by [`pocketkv_store_get`]. Null is ignored.
///
/// # Safety
///
/// `ptr` and `len` must be exactly what `pocketkv_store_get` returned, and the
/// buffer must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn pocketkv_buffer_free(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)));
}

/// # Safety
///
/// `key` and `value` must be valid for their lengths.
#[no_mangle]
pub unsafe extern "C" fn pocketkv_store_set(
    store: u64,
    key: *const u8,
    key_len: usize,
    value: *const u8,
    value_len: usize,
) -> bool {
    match (bytes_arg(key, key_len), bytes_arg(value, value_len)) {
        (Some(key), Some(value)) => super::store_set(Handle::from_raw(store), key, value),
        _ => false,
    }
}

/// # Safety
///
/// `key` must be valid for `key_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn pocketkv_store_del(store: u64, key: *const u8, key_len: usize) -> bool {
    match bytes_arg(key, key_len) {
        Some(key) => super::store_del(Handle::from_raw(store), key),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn pocketkv_server_new(store: u64, port: u16) -> u64 {
    super::server_new(Handle::from_raw(store), port).map_or(0, Handle::as_raw)
}

#[no_mangle]
pub extern "C" fn pocketkv_server_new_default(store: u64) -> u64 {
    super::server_new_default(Handle::from_raw(store)).map_or(0, Handle::as_raw)
}

#[no_mangle]
pub extern "C" fn pocketkv_server_start(server: u64) -> bool {
    match super::server_start(Handle::from_raw(server)) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(server, error = %e, "Failed to start server");
            false
        }
    }
}

/// Port the server is listening on, or `0` if it is not running.
#[no_mangle]
pub extern "C" fn pocketkv_server_port(server: u64) -> u16 {
    super::server_local_addr(Handle::from_raw(server)).map_or(0, |addr| addr.port())
}

#[no_mangle]
pub extern "C" fn pocketkv_server_stop(server: u64) -> bool {
    super::server_stop(Handle::from_raw(server)).is_ok()
}

#[no_mangle]
pub extern "C" fn pocketkv_server_free(server: u64) -> bool {
    super::server_free(Handle::from_raw(server))
}

#[no_mangle]
pub extern "C" fn pocketkv_init_logging() -> bool {
    super::init_logging()
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn get(store: u64, key: &[u8]) -> Option<Vec<u8>> {
        let mut len = usize::MAX;
        let ptr = pocketkv_store_get(store, key.as_ptr(), key.len(), &mut len);
        if ptr.is_null() {
            assert_eq!(len, 0);
            return None;
        }
        let value = std::slice::from_raw_parts(ptr, len).to_vec();
        pocketkv_buffer_free(ptr, len);
        Some(value)
    }

    unsafe fn set(store: u64, key: &[u8], value: &[u8]) -> bool {
        pocketkv_store_set(store, key.as_ptr(), key.len(), value.as_ptr(), value.len())
    }

    #[test]
    fn test_store_through_c_abi() {
        unsafe {
            let store = pocketkv_store_new();
            assert_ne!(store, 0);

            assert_eq!(get(store, b"key"), None);
            assert!(set(store, b"key", b"va\0lue"));
            assert_eq!(get(store, b"key"), Some(b"va\0lue".to_vec()));

            assert!(set(store, b"empty", b""));
            assert_eq!(get(store, b"empty"), Some(Vec::new()));

            assert!(pocketkv_store_del(store, b"key".as_ptr(), 3));
            assert!(!pocketkv_store_del(store, b"key".as_ptr(), 3));

            assert!(pocketkv_store_free(store));
            assert!(!set(store, b"key", b"value"));
        }
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        unsafe {
            let store = pocketkv_store_new();

            assert!(!pocketkv_store_set(store, ptr::null(), 3, b"v".as_ptr(), 1));
            assert!(pocketkv_store_get(store, b"k".as_ptr(), 1, ptr::null_mut()).is_null());
            assert!(!pocketkv_store_del(store, ptr::null(), 1));

            // Null with zero length is the empty key.
            assert!(pocketkv_store_set(store, ptr::null(), 0, b"v".as_ptr(), 1));
            assert_eq!(get(store, b""), Some(b"v".to_vec()));

            pocketkv_buffer_free(ptr::null_mut(), 0);
            pocketkv_store_free(store);
        }
    }

    #[test]
    fn test_server_through_c_abi() {
        let store = pocketkv_store_new();
        let server = pocketkv_server_new(store, 0);
        assert_ne!(server, 0);
        assert_eq!(pocketkv_server_port(server), 0);

        assert!(pocketkv_server_start(server));
        assert!(!pocketkv_server_start(server));
        assert_ne!(pocketkv_server_port(server), 0);

        assert!(pocketkv_server_stop(server));
        assert!(!pocketkv_server_stop(server));
        assert!(!pocketkv_server_start(server));

        assert!(pocketkv_server_free(server));
        assert!(!pocketkv_server_free(server));
        assert!(pocketkv_store_free(store));
    }

    #[test]
    fn test_unknown_store_yields_zero_handle() {
        assert_eq!(pocketkv_server_new(0, 0), 0);
        assert_eq!(pocketkv_server_new_default(u64::MAX), 0);
    }
}
