//! Integer-backed handle types.
//!
//! Objects, pmaps, address space identifiers and processes are referred to by small opaque
//! handles rather than by pointer, so relations between them (page ownership, reverse mappings)
//! can be stored as plain tables.
//!
//! # Example
//!
//! ```
//! # use vmcore::int_like;
//! int_like!(RegionId, usize);
//!
//! const FIRST: RegionId = RegionId::new(1);
//! assert_eq!(FIRST.get(), 1);
//! ```
//!
//! The four-argument form also generates an atomic counter type handing out fresh handles:
//!
//! ```
//! # use vmcore::int_like;
//! # use core::sync::atomic::AtomicUsize;
//! int_like!(RegionId, AtomicRegionId, usize, AtomicUsize);
//!
//! static NEXT: AtomicRegionId = AtomicRegionId::new(RegionId::new(1));
//! assert_eq!(NEXT.next().get(), 1);
//! assert_eq!(NEXT.next().get(), 2);
//! ```

#[macro_export]
macro_rules! int_like {
    ($new_type_name:ident, $backing_type: ident) => {
        #[derive(Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
        pub struct $new_type_name($backing_type);

        impl $new_type_name {
            #[allow(dead_code)]
            #[inline]
            pub const fn get(self) -> $backing_type {
                self.0
            }
            #[allow(dead_code)]
            #[inline]
            pub const fn new(x: $backing_type) -> Self {
                $new_type_name(x)
            }
        }

        impl ::core::convert::From<$backing_type> for $new_type_name {
            #[inline]
            fn from(inner: $backing_type) -> Self {
                Self::new(inner)
            }
        }
        impl ::core::convert::From<$new_type_name> for $backing_type {
            #[inline]
            fn from(wrapped: $new_type_name) -> Self {
                wrapped.get()
            }
        }
        impl ::core::fmt::Display for $new_type_name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };

    ($new_type_name:ident, $new_atomic_type_name: ident, $backing_type:ident, $backing_atomic_type:ident) => {
        $crate::int_like!($new_type_name, $backing_type);

        /// Source of fresh handles. Every call to `next` returns a value never returned before.
        pub struct $new_atomic_type_name {
            container: ::core::sync::atomic::$backing_atomic_type,
        }

        impl $new_atomic_type_name {
            #[allow(dead_code)]
            #[inline]
            pub const fn new(first: $new_type_name) -> Self {
                $new_atomic_type_name {
                    container: ::core::sync::atomic::$backing_atomic_type::new(first.get()),
                }
            }
            #[allow(dead_code)]
            #[inline]
            pub fn next(&self) -> $new_type_name {
                $new_type_name::from(
                    self.container
                        .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed),
                )
            }
            #[allow(dead_code)]
            #[inline]
            pub fn peek(&self) -> $new_type_name {
                $new_type_name::from(self.container.load(::core::sync::atomic::Ordering::Relaxed))
            }
        }
    };
}

#[test]
fn handles_have_backing_size_and_count_up() {
    use core::mem::size_of;

    int_like!(UsizeLike, usize);
    assert_eq!(size_of::<UsizeLike>(), size_of::<usize>());

    int_like!(U32Like, AtomicU32Like, u32, AtomicU32);
    assert_eq!(size_of::<U32Like>(), size_of::<u32>());

    let counter = AtomicU32Like::new(U32Like::new(7));
    assert_eq!(counter.next(), U32Like::new(7));
    assert_eq!(counter.next(), U32Like::new(8));
    assert_eq!(counter.peek(), U32Like::new(9));
}
