use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Nice progress bar with over an iterator and a message.
/// COLOR is one of r,g,b
pub struct NiceProgressBar<'a, T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'a str);

impl<T: ExactSizeIterator, const COLOR: char> NiceProgressBar<'_, T, COLOR> {
    /// Iterate with the bar drawn unless `silent`.
    pub fn with_silent(self, silent: bool) -> ProgressBarIter<T> {
        let bar = if silent {
            ProgressBar::hidden()
        } else {
            self.bar()
        };
        self.0.progress_with(bar)
    }

    fn bar(&self) -> ProgressBar {
        let color = match COLOR {
            'b' => "blue",
            'g' => "green",
            'r' => "red",
            _ => "white",
        };
        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})",
                    self.1
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar
    }
}

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<'_, T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        self.with_silent(false)
    }
}

pub trait IterWithProgress<'a, T>: Iterator<Item = T> + 'a {
    /// Attach a progress bar unless `silent`.
    fn with_progress(self, silent: bool) -> Box<dyn Iterator<Item = T> + 'a>
    where
        Self: Sized + ExactSizeIterator,
    {
        if silent {
            Box::new(self)
        } else {
            let len = self.len() as u64;
            Box::new(self.progress_count(len))
        }
    }
}

impl<'a, T: Iterator<Item = U> + 'a, U> IterWithProgress<'a, U> for T {}

#[cfg(test)]
mod tests {
    use super::{IterWithProgress, NiceProgressBar};

    #[test]
    fn progress_keeps_items() {
        let items = NiceProgressBar::<_, 'g'>(0..5usize, "Counting")
            .into_iter()
            .collect::<Vec<_>>();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);

        let silent = vec!['a', 'b'].into_iter().with_progress(true).collect::<String>();
        assert_eq!(silent, "ab");
    }

    #[test]
    fn silent_bar_is_hidden() {
        let iter = NiceProgressBar::<_, 'g'>(0..3usize, "Loading").with_silent(true);
        assert!(iter.progress.is_hidden());
        assert_eq!(iter.collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
