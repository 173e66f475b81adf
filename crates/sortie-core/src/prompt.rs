//! Instructions handed to the agent inside the container.

use crate::task::Task;

/// Build the agent instructions for one task.
///
/// Implementation tasks execute the plan already on the issue; all others
/// write or refresh a plan and stop.
pub fn instructions_for(task: &Task) -> String {
    let n = task.id.0;
    if task.implement {
        format!(
            "Read GitHub issue #{n} (\"{title}\") with `gh issue view {n} --comments`. \
             Execute the implementation plan posted on the issue, paying close attention \
             to any new reviewer comments made since the plan was written. \
             Work on the current branch, commit your changes, push the branch, \
             and open a pull request that references #{n}.",
            title = task.title,
        )
    } else {
        format!(
            "Read GitHub issue #{n} (\"{title}\") with `gh issue view {n} --comments`. \
             Explore the repository and create an implementation plan for it. \
             If a plan was already posted, refresh it to account for any new comments. \
             Post the plan as a comment on issue #{n} using `gh issue comment`, then stop. \
             Do not modify any files.",
            title = task.title,
        )
    }
}
