/// Build [`Args`](crate::Args) from a list of values.
///
/// Host values go through [`Value::from_serde`](crate::Value::from_serde);
/// `@foreign(expr)` passes a [`ForeignValue`](crate::ForeignValue) through
/// unchanged. Evaluates to `Result<Args, BridgeError>`.
///
/// ```ignore
/// let args = pyhost::args![10, "x", scale = 2.5, target = @foreign(obj)]?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::core::result::Result::<_, $crate::BridgeError>::Ok($crate::Args::new())
    };
    ($($tokens:tt)+) => {{
        (|| -> ::core::result::Result<_, $crate::BridgeError> {
            Ok($crate::Args::from($crate::__pyhost_args_internal!(@array [] $($tokens)+)))
        })()
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __pyhost_args_internal {
    (@array [$($out:expr,)*]) => {
        [$($out,)*]
    };
    (@array [$($out:expr,)*] , $($rest:tt)*) => {
        $crate::__pyhost_args_internal!(@array [$($out,)*] $($rest)*)
    };
    (@array [$($out:expr,)*] @foreign($value:expr) $(, $($rest:tt)*)?) => {
        $crate::__pyhost_args_internal!(
            @array
            [
                $($out,)*
                $crate::Arg::Positional($crate::ArgValue::from($value)),
            ]
            $($($rest)*)?
        )
    };
    (@array [$($out:expr,)*] $name:ident = @foreign($value:expr) $(, $($rest:tt)*)?) => {
        $crate::__pyhost_args_internal!(
            @array
            [
                $($out,)*
                $crate::Arg::Named(
                    ::std::string::String::from(stringify!($name)),
                    $crate::ArgValue::from($value),
                ),
            ]
            $($($rest)*)?
        )
    };
    (@array [$($out:expr,)*] $name:ident = $value:expr $(, $($rest:tt)*)?) => {
        $crate::__pyhost_args_internal!(
            @array
            [
                $($out,)*
                $crate::Arg::Named(
                    ::std::string::String::from(stringify!($name)),
                    $crate::ArgValue::Host($crate::Value::from_serde(&$value)?),
                ),
            ]
            $($($rest)*)?
        )
    };
    (@array [$($out:expr,)*] $value:expr $(, $($rest:tt)*)?) => {
        $crate::__pyhost_args_internal!(
            @array
            [
                $($out,)*
                $crate::Arg::Positional($crate::ArgValue::Host($crate::Value::from_serde(&$value)?)),
            ]
            $($($rest)*)?
        )
    };
}
