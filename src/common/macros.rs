//! Useful macros.

/// Build a `Cmd` with `format!` syntax. The command is run by `bash` on the host under test.
macro_rules! cmd {
    ($($arg:tt)*) => {
        $crate::common::shell::Cmd::make_cmd(format!($($arg)*))
    };
}

/// Given an ordered list of path components, combine them into a path string.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str($part);
        )*

        path
    }}
}

/// Run a bunch of commands in order with the same shell, stopping at the first failure.
macro_rules! with_shell {
    ($shell:ident => $($cmd:expr),+ $(,)?) => {{
        let cmds = vec![$($cmd),+];

        for cmd in cmds.into_iter() {
            $shell.run(cmd)?;
        }
    }}
}
