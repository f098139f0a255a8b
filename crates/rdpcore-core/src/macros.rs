/// Asserts that the traits support dynamic dispatch.
///
/// From <https://docs.rs/static_assertions/1.1.0/src/static_assertions/assert_obj_safe.rs.html#72-76>
#[macro_export]
macro_rules! assert_obj_safe {
    ($($xs:path),+ $(,)?) => {
        $(const _: Option<&dyn $xs> = None;)+
    };
}

/// Asserts that the type implements _all_ of the given traits.
///
/// From <https://docs.rs/static_assertions/1.1.0/src/static_assertions/assert_impl.rs.html#113-121>
#[macro_export]
macro_rules! assert_impl {
    ($type:ty: $($trait:path),+ $(,)?) => {
        const _: fn() = || {
            // Only callable when `$type` implements all traits in `$($trait)+`.
            fn assert_impl_all<T: ?Sized $(+ $trait)+>() {}
            assert_impl_all::<$type>();
        };
    };
}

/// Bails out of the enclosing function with a `NotEnoughBytes` error when `$buf` is shorter
/// than `$expected`.
#[macro_export]
macro_rules! ensure_size {
    (ctx: $ctx:expr, in: $buf:expr, size: $expected:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if received < expected {
            return Err($crate::not_enough_bytes_err($ctx, received, expected));
        }
    }};
    (in: $buf:expr, size: $expected:expr) => {
        $crate::ensure_size!(ctx: Self::NAME, in: $buf, size: $expected)
    };
}

/// Shorthand for `ensure_size!` against `Self::FIXED_PART_SIZE`.
#[macro_export]
macro_rules! ensure_fixed_part_size {
    (in: $buf:expr) => {
        $crate::ensure_size!(ctx: Self::NAME, in: $buf, size: Self::FIXED_PART_SIZE)
    };
}

/// Builds an `InvalidField`-kind error, defaulting the context to `Self::NAME`.
#[macro_export]
macro_rules! invalid_field_err {
    ($ctx:expr, $field:expr, $reason:expr) => {
        $crate::invalid_field_err($ctx, $field, $reason)
    };
    ($field:expr, $reason:expr) => {
        $crate::invalid_field_err(Self::NAME, $field, $reason)
    };
}

/// Builds an `Other`-kind error, defaulting the context to `Self::NAME`.
#[macro_export]
macro_rules! other_err {
    ($ctx:expr, $description:expr) => {
        $crate::other_err($ctx, $description)
    };
    ($description:expr) => {
        $crate::other_err(Self::NAME, $description)
    };
}

/// Builds an `UnsupportedValue`-kind error, defaulting the context to `Self::NAME`.
#[macro_export]
macro_rules! unsupported_value_err {
    ($ctx:expr, $name:expr, $value:expr) => {
        $crate::unsupported_value_err($ctx, $name, $value)
    };
    ($name:expr, $value:expr) => {
        $crate::unsupported_value_err(Self::NAME, $name, $value)
    };
}

/// Fallibly narrows an integer, mapping overflow to an `InvalidField` error.
#[macro_export]
macro_rules! cast_length {
    ($ctx:expr, $field:expr, $len:expr) => {
        ::core::convert::TryInto::try_into($len).map_err(|_| $crate::invalid_field_err($ctx, $field, "too many elements"))
    };
    ($field:expr, $len:expr) => {
        $crate::cast_length!(Self::NAME, $field, $len)
    };
}

/// Fallibly narrows an integer, mapping overflow to an `InvalidField` error.
#[macro_export]
macro_rules! cast_int {
    ($ctx:expr, $field:expr, $val:expr) => {
        ::core::convert::TryInto::try_into($val).map_err(|_| $crate::invalid_field_err($ctx, $field, "out of range"))
    };
    ($field:expr, $val:expr) => {
        $crate::cast_int!(Self::NAME, $field, $val)
    };
}
