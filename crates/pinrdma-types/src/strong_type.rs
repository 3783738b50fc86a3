/// Declare a newtype wrapper around an integer primitive.
///
/// `strong_type!(Name, u32)` renders as decimal; `strong_type!(Name, u64, hex)`
/// renders `Display` as `0x…`, which reads better for frame numbers and
/// device addresses in logs.
///
/// The generated type is `Copy`, ordered, hashable, `Default`, transparent
/// under serde, and converts to and from the inner type. `Deref` exposes the
/// raw value.
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty) => {
        $crate::strong_type!(@common $name, $inner);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
    ($name:ident, $inner:ty, hex) => {
        $crate::strong_type!(@common $name, $inner);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
    (@common $name:ident, $inner:ty) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Return the raw value.
            #[inline]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    strong_type!(PlainId, u32);
    strong_type!(FrameNo, u64, hex);

    #[test]
    fn test_plain_display_debug() {
        let id = PlainId(7);
        assert_eq!(id.to_string(), "7");
        assert_eq!(format!("{:?}", id), "PlainId(7)");
        assert_eq!(id.get(), 7);
        assert_eq!(*id, 7);
    }

    #[test]
    fn test_hex_display_debug() {
        let pfn = FrameNo(0x1f40);
        assert_eq!(pfn.to_string(), "0x1f40");
        assert_eq!(format!("{:?}", pfn), "FrameNo(0x1f40)");
    }

    #[test]
    fn test_conversions() {
        let id: PlainId = 100u32.into();
        let raw: u32 = id.into();
        assert_eq!(raw, 100);
        assert_eq!(PlainId::default(), PlainId(0));
    }

    #[test]
    fn test_ordering() {
        let set: BTreeSet<FrameNo> = [FrameNo(3), FrameNo(1), FrameNo(2)].into_iter().collect();
        let ordered: Vec<u64> = set.into_iter().map(FrameNo::get).collect();
        assert_eq!(ordered, vec![1, 2, 3]);
    }

    #[test]
    fn test_serde_transparent() {
        let json = serde_json::to_string(&FrameNo(42)).unwrap();
        assert_eq!(json, "42");
        let back: FrameNo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FrameNo(42));
    }
}
