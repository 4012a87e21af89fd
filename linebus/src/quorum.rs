/// Get the size of a strict majority of the given cluster size.
pub fn majority_of(cluster_size: usize) -> usize {
    (cluster_size / 2) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_is_strict() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
        assert_eq!(majority_of(7), 4);
    }
}
