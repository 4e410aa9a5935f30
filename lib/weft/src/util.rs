/// Two-way choice usable in tail position, where a full `if`/`else`
/// block reads heavy for a pair of one-line outcomes.
#[macro_export]
macro_rules! either {
    ($cond:expr, $yes:expr, $no:expr) => {{
        if $cond {
            $yes
        } else {
            $no
        }
    }};
}
