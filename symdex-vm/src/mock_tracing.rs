#[allow(unused_macros)]
macro_rules! trace {
    (target: $target:expr, parent: $parent:expr, $($arg:tt)+ ) => {};
    (target: $target:expr, $($arg:tt)+ ) => {};
    (parent: $parent:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}

#[allow(unused_macros)]
macro_rules! debug {
    (target: $target:expr, parent: $parent:expr, $($arg:tt)+ ) => {};
    (target: $target:expr, $($arg:tt)+ ) => {};
    (parent: $parent:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}

#[allow(unused_macros)]
macro_rules! warn {
    (target: $target:expr, parent: $parent:expr, $($arg:tt)+ ) => {};
    (target: $target:expr, $($arg:tt)+ ) => {};
    (parent: $parent:expr, $($arg:tt)+ ) => {};
    ($($arg:tt)+) => {};
}
