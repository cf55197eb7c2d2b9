//! Assignment of data groups to computation sites.

use itertools::Itertools;
use log::debug;

use crate::error::{check_dim, EpError, Result};

/// Number of items in each group.
#[derive(Debug, Clone, Copy)]
pub enum GroupSizes<'a> {
    /// Every group has the same number of items.
    Constant(usize),
    PerGroup(&'a [usize]),
}

impl GroupSizes<'_> {
    fn to_vec(self, num_groups: usize) -> Result<Vec<usize>> {
        match self {
            GroupSizes::Constant(size) => Ok(vec![size; num_groups]),
            GroupSizes::PerGroup(sizes) => {
                check_dim("group sizes", num_groups, sizes.len())?;
                Ok(sizes.to_vec())
            }
        }
    }
}

impl<'a> From<&'a [usize]> for GroupSizes<'a> {
    fn from(sizes: &'a [usize]) -> Self {
        GroupSizes::PerGroup(sizes)
    }
}

/// How groups relate to sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// Site `k` holds exactly group `k`.
    OneToOne,
    /// Consecutive groups were merged into sites.
    Merged {
        /// Number of original groups in each site.
        groups_per_site: Vec<usize>,
        /// For each item, the index of its group among the groups of its site.
        within_site_group_index: Vec<usize>,
    },
    /// Groups were split over several sites.
    Split {
        /// Number of sites each group was split into.
        sites_per_group: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteAssignment {
    pub samples_per_site: Vec<usize>,
    pub partition: Partition,
}

impl SiteAssignment {
    pub fn num_sites(&self) -> usize {
        self.samples_per_site.len()
    }

    pub fn total_samples(&self) -> usize {
        self.samples_per_site.iter().sum()
    }
}

/// Distribute `num_groups` groups of items over `num_sites` sites.
///
/// If there are fewer sites than groups, the adjacent pair of groups with the
/// smallest combined size is merged until the number of sites is reached. If
/// there are more sites than groups, the group with the most items per part is
/// split into one more part until there are enough parts, and the items of a
/// group are divided as evenly as possible between its parts.
///
/// The result only depends on the arguments; ties go to the first candidate.
pub fn distribute_groups<'a>(
    num_groups: usize,
    num_sites: usize,
    sizes: impl Into<GroupSizes<'a>>,
) -> Result<SiteAssignment> {
    let sizes = sizes.into().to_vec(num_groups)?;
    if sizes.iter().any(|&size| size == 0) {
        return Err(EpError::Configuration(
            "every group must have at least one item".into(),
        ));
    }
    if num_sites < 2 {
        return Err(EpError::Configuration(format!(
            "at least two sites are needed, got {num_sites}"
        )));
    }
    let total: usize = sizes.iter().sum();
    if num_sites > total {
        return Err(EpError::Configuration(format!(
            "cannot distribute {total} items over {num_sites} sites"
        )));
    }

    let assignment = match num_sites.cmp(&num_groups) {
        std::cmp::Ordering::Less => merge_groups(&sizes, num_sites),
        std::cmp::Ordering::Equal => SiteAssignment {
            samples_per_site: sizes,
            partition: Partition::OneToOne,
        },
        std::cmp::Ordering::Greater => split_groups(&sizes, num_sites),
    };
    debug!(
        "Distributed {num_groups} groups over {num_sites} sites: {:?}",
        assignment.samples_per_site
    );
    Ok(assignment)
}

fn merge_groups(sizes: &[usize], num_sites: usize) -> SiteAssignment {
    let mut site_sizes = sizes.to_vec();
    // Combined size of each pair of neighbouring sites.
    let mut pair_sizes = sizes.iter().tuple_windows().map(|(a, b)| a + b).collect_vec();
    let mut groups_per_site = vec![1usize; sizes.len()];

    for _ in 0..(sizes.len() - num_sites) {
        let Some(idx) = pair_sizes.iter().position_min() else {
            break;
        };
        if idx + 1 < pair_sizes.len() {
            pair_sizes[idx + 1] += site_sizes[idx];
        }
        if idx > 0 {
            pair_sizes[idx - 1] += site_sizes[idx + 1];
        }
        site_sizes[idx] = pair_sizes[idx];
        site_sizes.remove(idx + 1);
        pair_sizes.remove(idx);
        groups_per_site[idx] += groups_per_site[idx + 1];
        groups_per_site.remove(idx + 1);
    }

    let mut within_site_group_index = Vec::with_capacity(sizes.iter().sum());
    let mut groups = sizes.iter();
    for &count in &groups_per_site {
        for (within, &size) in groups.by_ref().take(count).enumerate() {
            within_site_group_index.extend(std::iter::repeat(within).take(size));
        }
    }

    SiteAssignment {
        samples_per_site: site_sizes,
        partition: Partition::Merged {
            groups_per_site,
            within_site_group_index,
        },
    }
}

fn split_groups(sizes: &[usize], num_sites: usize) -> SiteAssignment {
    let mut parts = vec![1usize; sizes.len()];
    let mut per_part = sizes.iter().map(|&size| size as f64).collect_vec();

    for _ in 0..(num_sites - sizes.len()) {
        // First group with the most items per part.
        let idx = per_part
            .iter()
            .enumerate()
            .fold(0, |best, (idx, &val)| if val > per_part[best] { idx } else { best });
        parts[idx] += 1;
        per_part[idx] = sizes[idx] as f64 / parts[idx] as f64;
    }

    let samples_per_site = sizes
        .iter()
        .zip(parts.iter())
        .flat_map(|(&size, &count)| {
            let (base, extra) = (size / count, size % count);
            (0..count).map(move |part| if part < extra { base + 1 } else { base })
        })
        .collect_vec();

    SiteAssignment {
        samples_per_site,
        partition: Partition::Split {
            sites_per_group: parts,
        },
    }
}
