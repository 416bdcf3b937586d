use std::fmt;

/// Size of a command name key, including the trailing NUL.
pub const COMM_LEN: usize = 16;
/// Size of a container id key.
pub const CONTAINER_ID_LEN: usize = 64;

macro_rules! fixed_width_key {
    ($(#[$meta:meta])* $name:ident, $len:expr, $max:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name([u8; $len]);

        // We must explicitly mark the key as plain old data which can be safely memcopied by aya.
        unsafe impl aya::Pod for $name {}

        impl $name {
            /// Builds the key, truncating `value` when it doesn't fit.
            pub fn new(value: &str) -> Self {
                let mut key = [0; $len];
                let bytes = value.as_bytes();
                if bytes.len() > $max {
                    log::debug!("{value} truncated to {} bytes", $max);
                }
                let len = bytes.len().min($max);
                key[..len].copy_from_slice(&bytes[..len]);
                Self(key)
            }

            pub fn as_str(&self) -> &str {
                let len = self.0.iter().position(|b| *b == 0).unwrap_or($len);
                match std::str::from_utf8(&self.0[..len]) {
                    Ok(value) => value,
                    // truncation may split a multi-byte character
                    Err(err) => std::str::from_utf8(&self.0[..err.valid_up_to()]).unwrap_or(""),
                }
            }

            pub fn is_empty(&self) -> bool {
                self.0[0] == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.as_str())
            }
        }
    };
}

fixed_width_key!(
    /// Command name as stored by the kernel: at most 15 bytes and a NUL.
    CommKey,
    COMM_LEN,
    COMM_LEN - 1
);

fixed_width_key!(
    /// Container id, zero padded.
    ContainerIdKey,
    CONTAINER_ID_LEN,
    CONTAINER_ID_LEN
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_is_truncated() {
        let key = CommKey::new("a-very-long-command-name");
        assert_eq!(key.as_str(), "a-very-long-com");
        assert_eq!(CommKey::new("curl").to_string(), "curl");
        assert!(CommKey::new("").is_empty());
    }

    #[test]
    fn container_id_fills_the_key() {
        let id = "3f084b4c7b789c1a0f174da3fcd339e31125d3096b3ff46a0bef4fad71d09362";
        assert_eq!(ContainerIdKey::new(id).as_str(), id);
        assert_eq!(ContainerIdKey::new(id), ContainerIdKey::new(id));
    }

    #[test]
    fn multi_byte_truncation() {
        let key = CommKey::new("ééééééééé");
        assert_eq!(key.as_str(), "ééééééé");
    }
}
