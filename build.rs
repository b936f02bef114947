use rsconf::Target;
use std::error::Error;

fn main() {
    rsconf::rebuild_if_paths_changed(&["src", "Cargo.toml", "build.rs"]);

    let mut target = Target::new().unwrap();
    detect_cfgs(&mut target);
}

/// Check target system support for certain functionality dynamically when the build is invoked,
/// without their having to be explicitly enabled in the `cargo build --features xxx` invocation.
///
/// We are using [`rsconf::enable_cfg()`] instead of [`rsconf::enable_feature()`] as rust features
/// should be used for things that a user can/would reasonably enable or disable to tweak or coerce
/// behavior, but here we are testing for whether or not things are supported altogether.
#[rustfmt::skip]
fn detect_cfgs(target: &mut Target) {
    for (name, handler) in [
        // Ignore the first entry, it just sets up the type inference. Model new entries after the
        // second line.
        (
            "",
            &(|_: &Target| Ok(false)) as &dyn Fn(&Target) -> Result<bool, Box<dyn Error>>,
        ),
        ("apple", &detect_apple),
        ("bsd", &detect_bsd),
        ("have_pipe2", &|target| {
            Ok(target.has_symbol("pipe2"))
        }),
        // Detect if we have a waitstatus with the signal in the upper bits and the
        // return code in the lower byte (historically true on HP-UX style systems).
        ("HAVE_WAITSTATUS_SIGNAL_RET", &|target| {
            Ok(target.r#if("WEXITSTATUS(0x007f) == 0x7f", &["sys/wait.h"]))
        }),
    ] {
        match handler(target) {
            Err(e) => {
                rsconf::warn!("{}: {}", name, e);
                rsconf::declare_cfg(name, false);
            }
            Ok(enabled) => rsconf::declare_cfg(name, enabled),
        }
    }
}

fn detect_apple(_: &Target) -> Result<bool, Box<dyn Error>> {
    Ok(cfg!(target_vendor = "apple"))
}

fn detect_bsd(_: &Target) -> Result<bool, Box<dyn Error>> {
    // Instead of using `#[cfg(any(...))]` everywhere, create a `bsd` alias.
    Ok(cfg!(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
    )))
}
