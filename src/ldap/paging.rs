//! Per-connection state of paged searches.
use std::collections::{HashMap, VecDeque};

use super::{control::PagedResults, result::ResultCode};

/// Open continuation points kept per connection. Beyond this the oldest
/// cookie is forgotten.
pub const MAX_CURSORS: usize = 64;

/// Continuation points of the paged searches of one connection.
#[derive(Debug, Default)]
pub struct PagingContext {
	/// Offset into the result set by cookie.
	cursors: HashMap<Vec<u8>, usize>,
	/// Cookies of `cursors`, oldest first.
	issued: VecDeque<Vec<u8>>,
}

impl PagingContext {
	/// Create an empty context.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Select the page of `results` named by `control`.
	///
	/// Returns the page and the cookie of the next one, empty once the
	/// results are exhausted. A size of zero ends the search early. Cookies
	/// are single use; an unknown cookie yields `unwillingToPerform`.
	pub fn page<T>(
		&mut self,
		results: Vec<T>,
		control: &PagedResults,
	) -> Result<(Vec<T>, Vec<u8>), ResultCode> {
		let offset = if control.cookie.is_empty() {
			0
		} else {
			let offset =
				self.cursors.remove(&control.cookie).ok_or(ResultCode::UNWILLING_TO_PERFORM)?;
			self.issued.retain(|cookie| *cookie != control.cookie);
			offset
		};
		let size = usize::try_from(control.size).unwrap_or(0);
		if size == 0 {
			return Ok((Vec::new(), Vec::new()));
		}

		let total = results.len();
		let end = offset.saturating_add(size).min(total);
		let page = results.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
		let cookie = if end < total {
			let cookie = uuid::Uuid::new_v4().as_bytes().to_vec();
			if self.issued.len() == MAX_CURSORS {
				if let Some(oldest) = self.issued.pop_front() {
					self.cursors.remove(&oldest);
				}
			}
			self.cursors.insert(cookie.clone(), end);
			self.issued.push_back(cookie.clone());
			cookie
		} else {
			Vec::new()
		};
		Ok((page, cookie))
	}

	/// Number of open continuation points.
	#[must_use]
	pub fn len(&self) -> usize {
		self.cursors.len()
	}

	/// Whether no paged search is in progress.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.cursors.is_empty()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{PagingContext, MAX_CURSORS};
	use crate::ldap::{control::PagedResults, result::ResultCode};

	#[test]
	fn pages_through_results() {
		let mut paging = PagingContext::new();
		let results: Vec<u32> = (1..=2500).collect();

		let first = PagedResults::new(1000, Vec::new());
		let (page, cookie) = paging.page(results.clone(), &first).unwrap();
		assert_eq!((page.first(), page.last(), page.len()), (Some(&1), Some(&1000), 1000));
		assert!(!cookie.is_empty());

		let next = PagedResults::new(1000, cookie);
		let (page, cookie) = paging.page(results.clone(), &next).unwrap();
		assert_eq!((page.first(), page.last()), (Some(&1001), Some(&2000)));
		assert!(!cookie.is_empty());

		let (page, cookie) = paging.page(results, &PagedResults::new(1000, cookie)).unwrap();
		assert_eq!((page.first(), page.last(), page.len()), (Some(&2001), Some(&2500), 500));
		assert!(cookie.is_empty());
		assert!(paging.is_empty());
	}

	#[test]
	fn unknown_cookie_and_abandon() {
		let mut paging = PagingContext::new();
		assert_eq!(
			paging.page(vec![1, 2, 3], &PagedResults::new(1, b"nope".to_vec())).unwrap_err(),
			ResultCode::UNWILLING_TO_PERFORM
		);

		let (_, cookie) = paging.page(vec![1, 2, 3], &PagedResults::new(1, Vec::new())).unwrap();
		assert_eq!(paging.len(), 1);
		let (page, next) = paging.page(vec![1, 2, 3], &PagedResults::new(0, cookie)).unwrap();
		assert!(page.is_empty() && next.is_empty());
		assert!(paging.is_empty());
	}

	#[test]
	fn abandoned_searches_are_evicted_oldest_first() {
		let mut paging = PagingContext::new();
		let start = PagedResults::new(1, Vec::new());
		let cookies: Vec<Vec<u8>> =
			(0..=MAX_CURSORS).map(|_| paging.page(vec![1, 2, 3], &start).unwrap().1).collect();
		assert_eq!(paging.len(), MAX_CURSORS);

		let oldest = PagedResults::new(1, cookies[0].clone());
		let evicted = paging.page(vec![1, 2, 3], &oldest).unwrap_err();
		assert_eq!(evicted, ResultCode::UNWILLING_TO_PERFORM);
		let newest = PagedResults::new(1, cookies[MAX_CURSORS].clone());
		let (page, _) = paging.page(vec![1, 2, 3], &newest).unwrap();
		assert_eq!(page, [2]);
	}
}
