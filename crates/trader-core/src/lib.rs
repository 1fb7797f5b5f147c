//! 트레이딩 코어 도메인 모델.
//!
//! 거래소 커넥터, 포지션 사이징, 주문 실행 crate가 공유하는
//! 주문 의도, 포지션 스냅샷, 상품 명세, 호가 타입을 정의합니다.
//! 이 crate는 I/O를 수행하지 않습니다.

pub mod domain;

pub use domain::*;
