use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub fn create_progress_bar(
    progress: &MultiProgress,
    quiet: bool,
    len: usize,
    label: String,
) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = progress.add(ProgressBar::new(len as u64));
    let style = ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style.progress_chars("=> "));
    bar.set_message(label);
    bar
}
