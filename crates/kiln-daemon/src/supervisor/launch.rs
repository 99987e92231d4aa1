use std::path::Path;

use super::child::LaunchSpec;
use crate::store::Instance;

fn runs_directly(java: &str) -> bool {
    let j = java.trim();
    j.is_empty() || j.eq_ignore_ascii_case("none")
}

/// Builds the command line for an instance.
///
/// - `java` empty or `none`: `core` is executed directly with `args`.
/// - `core` starting with `@`: passed to the JVM as an argument file (Forge style).
/// - otherwise: `java -Xms -Xmx <args> -jar <core> nogui`.
pub fn instance_launch_spec(instance: &Instance) -> LaunchSpec {
    let cwd = instance.base_path.clone();
    let core = instance.core.trim();

    if runs_directly(&instance.java) {
        let exec = if Path::new(core).is_absolute() {
            core.to_string()
        } else {
            cwd.join(core).display().to_string()
        };
        return LaunchSpec {
            exec,
            args: instance.args.clone(),
            cwd,
        };
    }

    let mut args = Vec::new();
    if instance.min_memory_mb > 0 {
        args.push(format!("-Xms{}M", instance.min_memory_mb));
    }
    if instance.max_memory_mb > 0 {
        args.push(format!("-Xmx{}M", instance.max_memory_mb));
    }
    args.extend(instance.args.iter().filter(|a| !a.trim().is_empty()).cloned());
    if core.starts_with('@') {
        args.push(core.to_string());
    } else {
        args.push("-jar".to_string());
        args.push(core.to_string());
    }
    args.push("nogui".to_string());

    LaunchSpec {
        exec: instance.java.trim().to_string(),
        args,
        cwd,
    }
}
