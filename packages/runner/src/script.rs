// ABOUTME: Compiles a job's command list into a single instrumented shell script
// ABOUTME: Emits the start/end marker lines the coordinator parses for per-command timing

use crate::config::ScriptConfig;
use crate::job::Job;

/// Bounded wait for network reachability before the first command runs.
/// 50 iterations of 0.1s; exits 1 if the container network never comes up.
const WAIT_FOR_NETWORK: &str = "i=1; d=0\n\
while [ $i -le 50 ]; do\n\
i=$(($i + 1))\n\
if [ -z \"$(ip route get 8.8.8.8 2>/dev/null | grep -v unreachable)\" ]; then\n\
sleep 0.1; continue\n\
fi\n\
d=1; break;\n\
done\n\
if [ $d -eq 0 ]; then\n\
exit 1\n\
fi";

/// Compile a job into one POSIX shell script.
///
/// The script runs every command in order, short-circuiting after the first
/// nonzero exit, then runs the `after_failure` commands only if something
/// failed, and finally exits with the first failing command's code. Each
/// executed command is bracketed by marker lines
/// (`::<prefix>:command:<i>:start:<unixtime>::` and the matching `end` line
/// carrying the exit code) that the coordinator parses out of the log stream.
/// The marker format is a wire contract; do not change field order or the
/// `::` delimiter.
///
/// Pure and deterministic: compiling the same job twice yields identical
/// output.
pub fn compile(job: &Job, config: &ScriptConfig) -> String {
    let mut script = Vec::new();
    script.push(format!("cd \"{}\"", config.workdir));
    script.push(WAIT_FOR_NETWORK.to_string());
    script.push("GLOB_EXIT=0".to_string());

    for (idx, command) in job.commands.iter().enumerate() {
        script.push(block_start(&config.prefix, "command", "=", idx));
        script.push(command.clone());
        script.push(block_end(&config.prefix, "command", "=", idx));
    }

    for (idx, command) in job.after_failure.iter().enumerate() {
        script.push(block_start(&config.prefix, "after_failure", "!=", idx));
        script.push(command.clone());
        script.push(block_end(&config.prefix, "after_failure", "!=", idx));
    }

    script.push("exit $GLOB_EXIT;".to_string());
    script.join("\n")
}

/// Guarded block opener: prints the start marker, then re-opens the guard so
/// the command itself runs under the same condition.
fn block_start(prefix: &str, namespace: &str, guard: &str, idx: usize) -> String {
    format!(
        "if [ $GLOB_EXIT {guard} 0 ]; then\n\
         printf \"::{prefix}:{namespace}:{idx}:start:%d::\\n\" `date +%s`;\n\
         fi;\n\
         if [ $GLOB_EXIT {guard} 0 ]; then"
    )
}

/// Guarded block closer: captures the command's exit code, folds it into
/// `GLOB_EXIT` (first failure wins), and prints the end marker.
fn block_end(prefix: &str, namespace: &str, guard: &str, idx: usize) -> String {
    format!(
        "PREV_EXIT=$?;\n\
         fi;\n\
         if [ $GLOB_EXIT {guard} 0 ]; then\n\
         GLOB_EXIT=$PREV_EXIT;\n\
         printf \"::{prefix}:{namespace}:{idx}:end:%d:%d::\\n\" `date +%s` $PREV_EXIT;\n\
         fi;"
    )
}
